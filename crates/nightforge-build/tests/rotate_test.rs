use std::path::Path;

use chrono::{TimeZone, Utc};
use mockall::mock;
use nightforge_build::rotate::RotationEngine;
use nightforge_exec::{ProcessRunner, RunOutput, RunnerError};

mock! {
    Runner {}

    impl ProcessRunner for Runner {
        async fn run<'a>(
            &self,
            program: &str,
            args: &[String],
            cwd: Option<&'a Path>,
        ) -> Result<RunOutput, RunnerError>;
        async fn run_streaming<'a>(
            &self,
            program: &str,
            args: &[String],
            cwd: Option<&'a Path>,
        ) -> Result<(), RunnerError>;
        async fn run_shell(&self, command: &str, cwd: &Path) -> Result<RunOutput, RunnerError>;
    }
}

fn ok_output(stdout: &str) -> Result<RunOutput, RunnerError> {
    Ok(RunOutput {
        stdout: stdout.to_owned(),
        stderr: String::new(),
    })
}

fn expect_listings(mock: &mut MockRunner, containers: &'static str, images: &'static str) {
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"ps".to_owned()))
        .times(1)
        .returning(move |_, _, _| ok_output(containers));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"images".to_owned()))
        .times(1)
        .returning(move |_, _, _| ok_output(images));
}

#[tokio::test]
async fn removes_only_aged_images_in_our_format() {
    let mut mock = MockRunner::new();

    // 2023-06-15: the first image is 20 days old, the second 2 days, the
    // rest never match the tag format.
    expect_listings(
        &mut mock,
        "",
        "shop_nightly\t1.0.0-20230526000000\n\
         shop_nightly\t1.2.0-20230613000000\n\
         nginx\tlatest\n\
         shop_nightly\tbroken\n",
    );
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned())
                && args.contains(&"shop_nightly:1.0.0-20230526000000".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));

    let now = Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap();
    let removed = RotationEngine::new(&mock).rotate(7, now).await.unwrap();

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].to_string(), "shop_nightly:1.0.0-20230526000000");
}

#[tokio::test]
async fn images_backing_running_containers_are_skipped() {
    let mut mock = MockRunner::new();

    expect_listings(
        &mut mock,
        // One container still running on the obsolete image, one exited.
        "abc\tshop_nightly:1.0.0-20230101000000\t0.0.0.0:11345->8080/tcp\tUp 4 months\n\
         def\tapi_nightly:1.0.0-20230101000000\t\tExited (0) 3 months ago\n",
        "shop_nightly\t1.0.0-20230101000000\n\
         api_nightly\t1.0.0-20230101000000\n",
    );
    // Only the image whose container has exited is removed.
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned())
                && args.contains(&"api_nightly:1.0.0-20230101000000".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));

    let now = Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap();
    let removed = RotationEngine::new(&mock).rotate(7, now).await.unwrap();

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name, "api");
}

#[tokio::test]
async fn removal_failure_does_not_stop_the_pass() {
    let mut mock = MockRunner::new();

    expect_listings(
        &mut mock,
        "",
        "shop_nightly\t1.0.0-20230101000000\n\
         api_nightly\t1.0.0-20230101000000\n",
    );
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned()) && args.contains(&"shop_nightly:1.0.0-20230101000000".to_owned())
        })
        .times(1)
        .returning(|_, _, _| {
            Err(RunnerError::CommandFailed {
                program: "docker".to_owned(),
                args: vec![],
                code: Some(1),
                output: "image has dependent child images".to_owned(),
            })
        });
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned()) && args.contains(&"api_nightly:1.0.0-20230101000000".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));

    let now = Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap();
    let removed = RotationEngine::new(&mock).rotate(7, now).await.unwrap();

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name, "api");
}

#[tokio::test]
async fn fresh_store_removes_nothing() {
    let mut mock = MockRunner::new();

    expect_listings(&mut mock, "", "shop_nightly\t1.0.0-20230614000000\n");

    let now = Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap();
    let removed = RotationEngine::new(&mock).rotate(7, now).await.unwrap();

    assert!(removed.is_empty());
}
