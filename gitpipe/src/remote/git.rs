//! Git source driven by the `git` binary.
//!
//! References without a scheme are treated as SSH remotes; an URL
//! fragment names the branch or tag to follow.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Source, SourceError};
use crate::command::{in_dir, Invoker};

const DEFAULT_BRANCH: &str = "master";

/// Remote repository polled with shallow clones and hard resets.
pub struct GitSource {
    raw_url: String,
    url: Url,
    branch: String,
}

impl GitSource {
    /// Builds a source from an already-parsed URL.
    pub fn new(url: Url) -> Self {
        let branch = match url.fragment() {
            Some(fragment) if !fragment.is_empty() => fragment.to_string(),
            _ => DEFAULT_BRANCH.to_string(),
        };
        let mut raw = url.clone();
        raw.set_fragment(None);
        Self {
            raw_url: raw.to_string(),
            url,
            branch,
        }
    }

    /// Parses a repository reference.
    ///
    /// A reference without a scheme becomes an SSH remote; the short
    /// `host:path` form gets the default SSH port spliced in so it
    /// parses as an URL.
    pub fn from_reference(reference: &str) -> Result<Self, SourceError> {
        let mut normalized = reference.to_string();
        if !normalized.contains("://") {
            if !has_explicit_port(&normalized) {
                normalized = normalized.replace(':', ":22/");
            }
            normalized = format!("ssh://{normalized}");
        }
        let url = Url::parse(&normalized)
            .map_err(|error| SourceError::InvalidReference(error.to_string()))?;
        Ok(Self::new(url))
    }

    /// Branch or tag this source follows.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    async fn clone_into(
        &self,
        ctx: &CancellationToken,
        invoker: &Invoker,
    ) -> Result<(), SourceError> {
        invoker
            .run(
                "git",
                [
                    "clone",
                    "--depth",
                    "1",
                    &self.raw_url,
                    "-b",
                    &self.branch,
                    ".",
                ],
            )
            .exec(ctx)
            .await?;
        Ok(())
    }

    async fn fetch(&self, ctx: &CancellationToken, invoker: &Invoker) -> Result<(), SourceError> {
        invoker
            .run("git", ["fetch", "-q", "origin", &self.branch])
            .exec(ctx)
            .await?;
        Ok(())
    }

    async fn reset(&self, ctx: &CancellationToken, invoker: &Invoker) -> Result<(), SourceError> {
        invoker
            .run(
                "git",
                ["reset", "-q", "--hard", &format!("origin/{}", self.branch)],
            )
            .exec(ctx)
            .await?;
        Ok(())
    }

    async fn head_hash(
        &self,
        ctx: &CancellationToken,
        invoker: &Invoker,
    ) -> Result<String, SourceError> {
        Ok(invoker
            .run("git", ["rev-parse", "HEAD"])
            .output(ctx)
            .await?)
    }
}

#[async_trait]
impl Source for GitSource {
    fn ref_url(&self) -> &Url {
        &self.url
    }

    async fn poll(
        &self,
        ctx: &CancellationToken,
        target_dir: &Path,
    ) -> Result<bool, SourceError> {
        let invoker = in_dir(target_dir);
        let fresh = !is_cloned(target_dir);

        if fresh {
            self.clone_into(ctx, &invoker).await?;
        } else {
            self.fetch(ctx, &invoker).await?;
        }

        let previous = self.head_hash(ctx, &invoker).await?;
        self.reset(ctx, &invoker).await?;
        let current = self.head_hash(ctx, &invoker).await?;

        Ok(fresh || previous != current)
    }
}

fn is_cloned(dir: &Path) -> bool {
    dir.join(".git").is_dir()
}

fn has_explicit_port(reference: &str) -> bool {
    let Some((_, rest)) = reference.split_once(':') else {
        return false;
    };
    let port: String = rest.chars().take_while(char::is_ascii_digit).collect();
    !port.is_empty() && rest[port.len()..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_reference_keeps_scheme() {
        let source = GitSource::from_reference("https://example.com/u/my-app.git").unwrap();
        assert_eq!(source.ref_url().scheme(), "https");
        assert_eq!(source.branch(), "master");
    }

    #[test]
    fn test_fragment_selects_branch() {
        let source =
            GitSource::from_reference("https://example.com/u/my-app.git#release").unwrap();
        assert_eq!(source.branch(), "release");
        // Fragment must not leak into the clone URL.
        assert!(!source.raw_url.contains('#'));
    }

    #[test]
    fn test_scp_style_reference_becomes_ssh() {
        let source = GitSource::from_reference("git@example.com:u/my-app.git").unwrap();
        assert_eq!(source.ref_url().scheme(), "ssh");
        assert_eq!(source.ref_url().port(), Some(22));
        assert_eq!(source.ref_url().path(), "/u/my-app.git");
    }

    #[test]
    fn test_explicit_port_is_kept() {
        let source = GitSource::from_reference("git@example.com:2222/u/my-app.git").unwrap();
        assert_eq!(source.ref_url().port(), Some(2222));
    }

    #[test]
    fn test_garbage_reference_fails() {
        assert!(GitSource::from_reference("http://[broken").is_err());
    }

    #[tokio::test]
    async fn test_poll_detects_change_between_local_repos() {
        let ctx = CancellationToken::new();
        let upstream = tempfile::tempdir().unwrap();
        let invoker = in_dir(upstream.path());
        invoker
            .run("git", ["init", "-q", "-b", "master", "."])
            .exec(&ctx)
            .await
            .unwrap();
        invoker
            .run("git", ["config", "user.email", "test@example.com"])
            .exec(&ctx)
            .await
            .unwrap();
        invoker
            .run("git", ["config", "user.name", "Test"])
            .exec(&ctx)
            .await
            .unwrap();
        std::fs::write(upstream.path().join("file"), "one").unwrap();
        invoker.run("git", ["add", "."]).exec(&ctx).await.unwrap();
        invoker
            .run("git", ["commit", "-q", "-m", "one"])
            .exec(&ctx)
            .await
            .unwrap();

        let source = GitSource::from_reference(&format!(
            "file://{}",
            upstream.path().display()
        ))
        .unwrap();
        let checkout = tempfile::tempdir().unwrap();

        // First poll clones and reports a change.
        assert!(source.poll(&ctx, checkout.path()).await.unwrap());
        // Second poll with no upstream change reports none.
        assert!(!source.poll(&ctx, checkout.path()).await.unwrap());

        // Upstream moves, next poll reports the change.
        std::fs::write(upstream.path().join("file"), "two").unwrap();
        invoker.run("git", ["add", "."]).exec(&ctx).await.unwrap();
        invoker
            .run("git", ["commit", "-q", "-m", "two"])
            .exec(&ctx)
            .await
            .unwrap();
        assert!(source.poll(&ctx, checkout.path()).await.unwrap());
    }
}
