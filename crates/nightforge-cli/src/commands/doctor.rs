use std::fmt::Write as _;
use std::path::Path;

use nightforge_build::template::TemplateStore;
use nightforge_core::config::Config;
use nightforge_exec::{DockerClient, ProcessRunner, RealRunner};

struct Check {
    name: &'static str,
    result: Result<String, String>,
}

/// Preflight for a scheduled run: the external tools, the configuration,
/// and every template the configured applications will need.
pub async fn doctor(config_path: &Path) -> anyhow::Result<()> {
    let runner = RealRunner;
    let mut checks = Vec::new();

    let docker = DockerClient::new(&runner);
    checks.push(Check {
        name: "docker daemon",
        result: docker
            .server_version()
            .await
            .map(|v| format!("server {v}"))
            .map_err(|e| e.to_string()),
    });

    checks.push(Check {
        name: "git",
        result: runner
            .run("git", &["--version".to_owned()], None)
            .await
            .map(|out| out.stdout.trim().to_owned())
            .map_err(|e| e.to_string()),
    });

    let config = Config::load(config_path);
    checks.push(Check {
        name: "configuration",
        result: config
            .as_ref()
            .map(|c| format!("{} application(s)", c.apps.len()))
            .map_err(|e| e.to_string()),
    });

    if let Ok(config) = &config {
        let options = &config.options;
        match TemplateStore::load(&options.template_dir) {
            Ok(store) => {
                for app in &config.apps {
                    let found = store.contains(&app.docker_template);
                    checks.push(Check {
                        name: "app template",
                        result: if found {
                            Ok(format!("{} -> {}", app.name, app.docker_template))
                        } else {
                            Err(format!(
                                "{}: no template named '{}'",
                                app.name, app.docker_template
                            ))
                        },
                    });
                }
                checks.push(Check {
                    name: "finalize template",
                    result: if store.contains("finalize") {
                        Ok("found".to_owned())
                    } else {
                        Err("missing".to_owned())
                    },
                });
            }
            Err(e) => checks.push(Check {
                name: "templates",
                result: Err(e.to_string()),
            }),
        }

        checks.push(Check {
            name: "environment dir",
            result: if options.env_dir.is_dir() {
                Ok(options.env_dir.display().to_string())
            } else {
                Err(format!("{} does not exist", options.env_dir.display()))
            },
        });
    }

    let mut failed = false;
    let mut rendered = String::new();
    for check in &checks {
        match &check.result {
            Ok(detail) => writeln!(rendered, "  ok   {:<18} {detail}", check.name)?,
            Err(detail) => {
                failed = true;
                writeln!(rendered, "  FAIL {:<18} {detail}", check.name)?;
            }
        }
    }

    println!();
    println!("{rendered}");

    if failed {
        anyhow::bail!("some checks failed, see above for details");
    }
    Ok(())
}
