//! Hand-off of a URL to the user (browser, terminal, test recorder).

/// Opens a URL outside the process.
///
/// Used for the checkout page and for OAuth sign-in.
pub trait Redirect: Send + Sync {
    fn open(&self, url: &str) -> anyhow::Result<()>;
}
