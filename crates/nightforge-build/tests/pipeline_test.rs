use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mockall::mock;
use nightforge_build::pipeline::BuildPipeline;
use nightforge_build::retry::Sleeper;
use nightforge_build::template::TemplateStore;
use nightforge_core::config::{AppSpec, PortForward, RunOptions, VersionSource};
use nightforge_core::tag::Mode;
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

struct NoSleep;

impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

struct CountingSleeper(AtomicUsize);

impl Sleeper for CountingSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn ok_output(stdout: &str) -> Result<RunOutput, RunnerError> {
    Ok(RunOutput {
        stdout: stdout.to_owned(),
        stderr: String::new(),
    })
}

fn command_failed(output: &str) -> RunnerError {
    RunnerError::CommandFailed {
        program: "docker".to_owned(),
        args: vec![],
        code: Some(1),
        output: output.to_owned(),
    }
}

/// Template directory with one app template and the shared finalize step.
fn templates() -> (tempfile::TempDir, TemplateStore) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("web.tera"),
        "FROM node:18\nCOPY {{ appdir }} /app\nENV VERSION={{ version }}\nENV DNS={{ dns }}\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("finalize.tera"),
        "FROM {{ image }}\nLABEL app={{ name }}\n",
    )
    .unwrap();
    let store = TemplateStore::load(dir.path()).unwrap();
    (dir, store)
}

fn nightly_app(name: &str) -> AppSpec {
    AppSpec {
        name: name.to_owned(),
        repo: format!("git@example.com:{name}.git"),
        branch: "master".to_owned(),
        mode: Mode::Nightly,
        docker_template: "web".to_owned(),
        build_cmd: None,
        build_dir: None,
        version_cmd: Some("npm version {{ version }} --no-git-tag-version".to_owned()),
        version_source: VersionSource::GitTag,
        port_forwards: vec![],
        port: None,
        inner_port: None,
        volumes: vec![],
        env: BTreeMap::new(),
    }
}

fn release_app(name: &str) -> AppSpec {
    AppSpec {
        mode: Mode::Release,
        version_cmd: None,
        ..nightly_app(name)
    }
}

/// Expectations common to every nightly run: clone, remote tag lookup,
/// version write-back.
fn expect_nightly_front(mock: &mut MockRunner, tag: &'static str) {
    mock.expect_run()
        .withf(|p, args, _| p == "git" && args.contains(&"clone".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|p, args, _| p == "git" && args.contains(&"ls-remote".to_owned()))
        .times(1)
        .returning(move |_, _, _| ok_output(&format!("deadbeef\trefs/tags/{tag}\n")));
    mock.expect_run_shell()
        .withf(|command, _| command.starts_with("npm version "))
        .times(1)
        .returning(|_, _| ok_output(""));
}

#[tokio::test]
async fn nightly_build_produces_timestamped_tag_and_starts_container() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    expect_nightly_front(&mut mock, "v1.2.0");

    // Staging and finalize builds.
    mock.expect_run()
        .withf(|p, args, _| {
            p == "docker"
                && args.contains(&"build".to_owned())
                && args.contains(&"shop_nightly:stage".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output("built"));
    mock.expect_run()
        .withf(|p, args, _| {
            p == "docker"
                && args.contains(&"build".to_owned())
                && args.iter().any(|a| a.starts_with("shop_nightly:1.2.0-"))
        })
        .times(1)
        .returning(|_, _, _| ok_output("finalized"));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned()) && args.contains(&"shop_nightly:stage".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));

    // Deliver: no old containers, start the new one.
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"ps".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"run".to_owned())
                && args.contains(&"--name=shop_nightly".to_owned())
                && args.contains(&"--dns=8.8.8.8".to_owned())
                && args.contains(&"/var/log/shop_nightly:/var/log:rw".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output("cafebabe"));

    let options = RunOptions::default();
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&nightly_app("shop")).await;

    assert!(!outcome.is_failure(), "log: {}", outcome.log);
    let tag = outcome.tag.unwrap();
    assert_eq!(tag.name, "shop");
    assert_eq!(tag.mode, Mode::Nightly);
    assert!(tag.version.starts_with("1.2.0-"));
    assert!(tag.build_timestamp().is_some());
    // Rendered manifest landed in the run root with the template variables
    // substituted.
    let manifest = std::fs::read_to_string(root.path().join("shop_nightly.dockerfile")).unwrap();
    assert!(manifest.contains("COPY shop_nightly /app"));
    assert!(manifest.contains("ENV DNS=8.8.8.8"));
}

#[tokio::test]
async fn transient_build_failures_are_retried_with_delays() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    expect_nightly_front(&mut mock, "v1.0.0");

    // Image build fails twice, then succeeds.
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned()) && args.contains(&"shop_nightly:stage".to_owned())
        })
        .times(3)
        .returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(command_failed("registry timeout"))
            } else {
                ok_output("built")
            }
        });
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned())
                && args.iter().any(|a| a.starts_with("shop_nightly:1.0.0-"))
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"rmi".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));

    let sleeper = CountingSleeper(AtomicUsize::new(0));
    let options = RunOptions {
        run_after_build: false,
        ..RunOptions::default()
    };
    let pipeline = BuildPipeline::new(&mock, &sleeper, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&nightly_app("shop")).await;

    assert!(!outcome.is_failure(), "log: {}", outcome.log);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(sleeper.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_retries_finalize_a_failed_outcome_with_the_log() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    expect_nightly_front(&mut mock, "v1.0.0");

    mock.expect_run()
        .withf(|_, args, _| args.contains(&"shop_nightly:stage".to_owned()))
        .times(2)
        .returning(|_, _, _| Err(command_failed("no space left on device")));

    let options = RunOptions {
        tries: 2,
        ..RunOptions::default()
    };
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&nightly_app("shop")).await;

    assert!(outcome.is_failure());
    assert!(outcome.tag.is_none());
    // Version was resolved before the failure, so the report can show it.
    assert!(outcome.version.as_deref().unwrap().starts_with("1.0.0-"));
    // The captured output is appended to the log once, not repeated through
    // the error message.
    assert_eq!(outcome.log.matches("no space left on device").count(), 1);
}

#[tokio::test]
async fn clone_failure_is_fatal_and_never_retried() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    mock.expect_run()
        .withf(|p, args, _| p == "git" && args.contains(&"clone".to_owned()))
        .times(1)
        .returning(|_, _, _| {
            Err(RunnerError::CommandFailed {
                program: "git".to_owned(),
                args: vec![],
                code: Some(128),
                output: "fatal: repository not found".to_owned(),
            })
        });

    let options = RunOptions::default();
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&nightly_app("shop")).await;

    assert!(outcome.is_failure());
    assert_eq!(outcome.version, None);
    assert!(outcome.log.contains("repository not found"));
}

#[tokio::test]
async fn release_build_is_squashed_and_archived() {
    let root = tempfile::tempdir().unwrap();
    let image_dir = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    // Clone must materialize the checkout: release reads its manifest.
    let clone_dir = root.path().join("shop_release");
    let manifest_dir = clone_dir.clone();
    mock.expect_run()
        .withf(|p, args, _| p == "git" && args.contains(&"clone".to_owned()))
        .times(1)
        .returning(move |_, _, _| {
            std::fs::create_dir_all(&manifest_dir).unwrap();
            std::fs::write(
                manifest_dir.join("package.json"),
                r#"{ "name": "shop", "version": "2.0.1" }"#,
            )
            .unwrap();
            ok_output("")
        });

    mock.expect_run()
        .withf(|_, args, _| args.contains(&"shop_release:stage".to_owned()) && args.contains(&"build".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output("built"));

    // Repack: create, export, remove scratch container, import, drop stage.
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"create".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output("scratch1\n"));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"export".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"rm".to_owned()) && args.contains(&"scratch1".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"import".to_owned()) && args.contains(&"shop_release:flat".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned()) && args.contains(&"shop_release:stage".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));

    // Finalize against the flattened image.
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"shop_release:2.0.1".to_owned()) && args.contains(&"build".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"rmi".to_owned()) && args.contains(&"shop_release:flat".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));

    // Deliver: save writes the tar the archiver compresses.
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"save".to_owned()))
        .times(1)
        .returning(|_, args, _| {
            let dest = args.iter().position(|a| a == "-o").unwrap() + 1;
            std::fs::write(&args[dest], b"image bytes").unwrap();
            ok_output("")
        });

    let options = RunOptions {
        image_dir: Some(image_dir.path().to_path_buf()),
        ..RunOptions::default()
    };
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&release_app("shop")).await;

    assert!(!outcome.is_failure(), "log: {}", outcome.log);
    assert_eq!(outcome.tag.unwrap().to_string(), "shop_release:2.0.1");
    assert!(image_dir.path().join("shop_release_2.0.1.tar.gz").is_file());
    // Cleanup removed the clone.
    assert!(!clone_dir.exists());
}

#[tokio::test]
async fn release_without_image_dir_stays_tagged_but_unarchived() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    let manifest_dir = root.path().join("shop_release");
    mock.expect_run()
        .withf(|p, args, _| p == "git" && args.contains(&"clone".to_owned()))
        .times(1)
        .returning(move |_, _, _| {
            std::fs::create_dir_all(&manifest_dir).unwrap();
            std::fs::write(
                manifest_dir.join("package.json"),
                r#"{ "name": "shop", "version": "2.0.1" }"#,
            )
            .unwrap();
            ok_output("")
        });
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned()) && args.contains(&"shop_release:stage".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned()) && args.contains(&"shop_release:2.0.1".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"rmi".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    // No create/export/import/save expectations: squash is off and no
    // archive directory is configured, so any such call fails the test.

    let options = RunOptions {
        squash: false,
        ..RunOptions::default()
    };
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&release_app("shop")).await;

    assert!(!outcome.is_failure(), "log: {}", outcome.log);
    assert_eq!(outcome.tag.unwrap().to_string(), "shop_release:2.0.1");
}

#[tokio::test]
async fn deploy_replaces_only_the_matching_old_container() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    expect_nightly_front(&mut mock, "v1.5.0");

    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned()) && args.contains(&"shop_nightly:stage".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned())
                && args.iter().any(|a| a.starts_with("shop_nightly:1.5.0-"))
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"rmi".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));

    // Old state: a previous build of this app on the same port, a sibling on
    // another port, and an unrelated container.
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"ps".to_owned()))
        .times(1)
        .returning(|_, _, _| {
            ok_output(
                "old1\tshop_nightly:1.4.0-20230101000000\t0.0.0.0:11345->8080/tcp\tUp 9 hours\n\
                 sib2\tshop_nightly:1.4.0-20230101000000\t0.0.0.0:11999->8080/tcp\tUp 9 hours\n\
                 oth3\tredis:7\t\tUp 2 days\n",
            )
        });
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"stop".to_owned()) && args.contains(&"old1".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"rm".to_owned()) && args.contains(&"old1".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"run".to_owned())
                && args.contains(&"0.0.0.0:11345:8080".to_owned())
                && args.contains(&"--expose=8080".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output("new\n"));

    let mut app = nightly_app("shop");
    app.port_forwards = vec![PortForward {
        host: "0.0.0.0".to_owned(),
        host_port: 11345,
        container_port: 8080,
    }];

    let options = RunOptions::default();
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);
    let outcome = pipeline.run(&app).await;

    assert!(!outcome.is_failure(), "log: {}", outcome.log);
}

#[tokio::test]
async fn a_failing_application_does_not_block_the_next() {
    let root = tempfile::tempdir().unwrap();
    let (_tdir, store) = templates();
    let mut mock = MockRunner::new();

    // First app: the clone explodes immediately.
    mock.expect_run()
        .withf(|p, args, _| {
            p == "git"
                && args.contains(&"clone".to_owned())
                && args.iter().any(|a| a.contains("bad.git"))
        })
        .times(1)
        .returning(|_, _, _| {
            Err(RunnerError::CommandFailed {
                program: "git".to_owned(),
                args: vec![],
                code: Some(128),
                output: "fatal: repository not found".to_owned(),
            })
        });

    // Second app runs to completion.
    mock.expect_run()
        .withf(|p, args, _| {
            p == "git"
                && args.contains(&"clone".to_owned())
                && args.iter().any(|a| a.contains("shop.git"))
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|p, args, _| p == "git" && args.contains(&"ls-remote".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output("deadbeef\trefs/tags/v1.1.0\n"));
    mock.expect_run_shell()
        .withf(|command, _| command.starts_with("npm version "))
        .times(1)
        .returning(|_, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned()) && args.contains(&"shop_nightly:stage".to_owned())
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| {
            args.contains(&"build".to_owned())
                && args.iter().any(|a| a.starts_with("shop_nightly:1.1.0-"))
        })
        .times(1)
        .returning(|_, _, _| ok_output(""));
    mock.expect_run()
        .withf(|_, args, _| args.contains(&"rmi".to_owned()))
        .times(1)
        .returning(|_, _, _| ok_output(""));

    let options = RunOptions {
        run_after_build: false,
        ..RunOptions::default()
    };
    let pipeline = BuildPipeline::new(&mock, &NoSleep, &store, root.path(), "8.8.8.8", &options);

    // The selection also leaves a third configured app out entirely; any
    // command for it would be an unexpected mock call.
    let apps = vec![
        nightly_app("bad"),
        nightly_app("shop"),
        nightly_app("ignored"),
    ];
    let selected = vec!["bad".to_owned(), "shop".to_owned()];
    let report = pipeline.run_all(&apps, &selected).await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].app, "bad");
    assert!(report.outcomes[0].is_failure());
    assert!(
        !report.outcomes[1].is_failure(),
        "log: {}",
        report.outcomes[1].log
    );
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.succeeded_count(), 1);
}
