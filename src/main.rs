use std::path::PathBuf;
use std::process::ExitCode;

use color_eyre::eyre::{Context, bail};
use x509_revocation::{
    config::Config, pki::certificate::ClientCertificate, setup::RevocationService, telemetry,
};

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    telemetry::init_tracing();

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("usage: x509-revocation <certificate.pem|certificate.der>...");
    }

    // Load configuration
    let config = Config::load().wrap_err("Failed to load configuration")?;
    tracing::debug!("Loaded configuration: {:?}", config);

    let service = RevocationService::start(&config.revocation)
        .wrap_err("Failed to build revocation checker")?;

    let mut rejected = 0usize;
    for path in &paths {
        let data = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let cert = ClientCertificate::from_pem_or_der(&data)
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;

        let result = service
            .check(&cert)
            .await
            .wrap_err_with(|| format!("Revocation check failed for {}", path.display()))?;

        let verdict = if result.permits_authentication() {
            "permitted"
        } else {
            rejected += 1;
            "rejected"
        };
        println!("{}: {verdict} ({result:?})", path.display());
    }

    Ok(if rejected == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
