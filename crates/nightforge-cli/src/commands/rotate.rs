use chrono::Utc;
use nightforge_build::rotate::RotationEngine;
use nightforge_exec::RealRunner;

pub async fn rotate(days: i64) -> anyhow::Result<()> {
    anyhow::ensure!(days > 0, "--days must be positive");

    let runner = RealRunner;
    let removed = RotationEngine::new(&runner).rotate(days, Utc::now()).await?;

    if removed.is_empty() {
        println!("nothing to rotate");
    } else {
        println!("removed {} image(s):", removed.len());
        for tag in removed {
            println!("  {tag}");
        }
    }
    Ok(())
}
