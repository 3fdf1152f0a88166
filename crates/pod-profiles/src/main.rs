use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use kube::CustomResourceExt;
use pod_profiles::{
    catalog::{self, KubeCatalog, ProfileCatalog, StaticCatalog},
    cli::{Command, Opts, RenderArguments, RunArguments},
    constants::{APP_NAME, ENV_PREFIX},
    crd::profile::Profile,
    logging, render, selection,
    webhook::{
        MutatorContext,
        deployment::KubeDeploymentLookup,
        server::{self, WebhookServer},
    },
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to serialize {what} as YAML"))]
    SerializeYaml {
        source: serde_yaml::Error,
        what: &'static str,
    },

    #[snafu(display("failed to read profile catalog {path:?}"))]
    ReadCatalog {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to load profile catalog {path:?}"))]
    LoadCatalog {
        source: catalog::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to select profiles"))]
    SelectProfiles { source: selection::Error },

    #[snafu(display("failed to render profiles"))]
    RenderProfiles { source: render::Error },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: server::Error },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: server::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", snafu::Report::from_error(error));
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Opts) -> Result<(), Error> {
    logging::initialize_logging(&format!("{ENV_PREFIX}_LOG"), APP_NAME)
        .context(InitializeLoggingSnafu)?;

    match opts.command {
        Command::Crd => {
            let crd = serde_yaml::to_string(&Profile::crd()).context(SerializeYamlSnafu {
                what: "CustomResourceDefinition",
            })?;
            print!("{crd}");
        }
        Command::Run(args) => run_webhook(args).await?,
        Command::Render(args) => {
            let rendered = render_profiles(&args).await?;
            print!("{rendered}");
        }
    }

    Ok(())
}

async fn run_webhook(args: RunArguments) -> Result<(), Error> {
    tracing::info!(
        bind_address = %args.bind_address,
        watch_namespace = args.watch_namespace.as_deref(),
        "starting pod profile webhook"
    );

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let catalog = KubeCatalog::new(client.clone(), args.catalog.catalog_page_size);
    let deployments = KubeDeploymentLookup::new(client, &args.deployment_resource());
    let context = MutatorContext::new(
        Arc::new(catalog),
        Arc::new(deployments),
        args.catalog.catalog_timeout,
    )
    .with_watch_namespace(args.watch_namespace.clone());

    let server = WebhookServer::new(
        args.bind_address,
        server::router(Arc::new(context)),
        &args.tls_files(),
    )
    .await
    .context(CreateWebhookServerSnafu)?;
    server.run().await.context(RunWebhookServerSnafu)
}

async fn render_profiles(args: &RenderArguments) -> Result<String, Error> {
    let catalog: Box<dyn ProfileCatalog> = match &args.catalog {
        Some(path) => {
            let yaml = tokio::fs::read_to_string(path)
                .await
                .context(ReadCatalogSnafu { path })?;
            let mut catalog = StaticCatalog::from_yaml(&yaml).context(LoadCatalogSnafu { path })?;
            if args.accept {
                catalog
                    .accept_missing()
                    .context(LoadCatalogSnafu { path })?;
            }
            Box::new(catalog)
        }
        None => {
            let client = kube::Client::try_default()
                .await
                .context(CreateClientSnafu)?;
            Box::new(KubeCatalog::new(
                client,
                args.catalog_options.catalog_page_size,
            ))
        }
    };

    let base = args.base_template();
    let labels = base
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.labels.clone())
        .unwrap_or_default();

    let selection = selection::select(
        catalog.as_ref(),
        &args.namespace,
        &labels,
        &args.profiles,
        args.catalog_options.catalog_timeout,
    )
    .await
    .context(SelectProfilesSnafu)?;
    tracing::info!(profiles = %selection.names().join(","), "selected profiles");

    let ranked = selection.templates().collect::<Vec<_>>();
    let rendered = render::render(&base, &ranked, &[]).context(RenderProfilesSnafu)?;
    serde_yaml::to_string(&rendered).context(SerializeYamlSnafu {
        what: "rendered pod template",
    })
}
