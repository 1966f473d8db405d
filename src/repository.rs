use crate::domain::App;

/// Derives the source repository URL of an app from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryResolver {
    git_host: String,
}

impl RepositoryResolver {
    pub fn new(git_host: impl Into<String>) -> Self {
        let git_host = git_host.into();
        Self {
            git_host: git_host.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn git_host(&self) -> &str {
        &self.git_host
    }

    pub fn repository_url(&self, app: &App) -> String {
        format!("git@{}:{}.git", self.git_host, app.name)
    }
}
