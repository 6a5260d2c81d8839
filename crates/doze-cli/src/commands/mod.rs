//! One module per subcommand.

pub mod abort;
pub mod guard;
pub mod inhibit;
pub mod request;
pub mod wake;
pub mod watch;

/// Build the single-threaded runtime the async commands run on.
pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
