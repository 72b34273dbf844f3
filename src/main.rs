use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webstack::{
    compose::compose,
    config::{Command, Opts, StackConfig},
    docker::{build_image, resolve_images},
    engine::ProvisioningEngine,
    kubestuff::{render, to_yaml, KubeEngine},
    spec::{ImageRef, StackSpec},
};

async fn inner_main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let config = StackConfig::load(opts.stack.as_deref())?;
    let stack = compose(&config)?;

    match opts.command {
        Command::Synth => {
            println!("{}", serde_json::to_string_pretty(&stack)?);
        }
        Command::Schema => {
            let schema = schemars::schema_for!(StackSpec);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Command::Manifests => {
            let images = resolve_images(&stack, false).await?;
            print!("{}", to_yaml(&render(&stack, &opts.namespace, &images)?)?);
        }
        Command::Build => {
            for container in &stack.task.containers {
                if let ImageRef::Asset(source) = &container.image {
                    let hash = build_image(source).await?;
                    println!("{}\t{}", container.name, hash.image_name());
                }
            }
        }
        Command::Deploy => {
            let images = resolve_images(&stack, true).await?;
            let engine = KubeEngine::try_default(opts.namespace.clone()).await?;
            let live = engine.apply(&stack, &images).await?;
            info!(stack = %stack.name, resources = live.applied.len(), "stack deployed");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = inner_main().await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}
