use tokio::io::BufReader;

use dataverse_annex::protocol::AnnexIo;
use dataverse_annex::remote::DataverseRemote;

// Single-threaded by design: the protocol is strictly serial, one request
// handled to completion before the next is read.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        // stdout carries the annex protocol; everything else goes to stderr
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::debug!("git-annex-remote-dataverse starting");

    let annex = AnnexIo::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    let mut remote = DataverseRemote::new(annex);
    remote
        .serve()
        .await
        .inspect_err(|e| tracing::error!("remote terminated: {e}"))?;

    tracing::debug!("git-annex-remote-dataverse shutting down");
    Ok(())
}
