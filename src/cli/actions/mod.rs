pub mod server;

/// What the binary runs once arguments are parsed.
#[derive(Debug)]
pub enum Action {
    Server(server::Args),
}

impl Action {
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Server(args) => server::execute(args).await,
        }
    }
}
