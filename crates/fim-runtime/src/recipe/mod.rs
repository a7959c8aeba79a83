//! Package recipes: named package lists with dependencies on other recipes.
//!
//! Recipes live at `<remote>/<dist>/latest/<name>.json` and are cached under
//! `<data>/recipes/<dist>/latest/`. Installing runs the distribution's
//! package manager as root inside the sandbox.

pub mod graph;

use std::collections::HashSet;
use std::path::PathBuf;

use fim_common::config::FimConfig;
use fim_common::error::{FimError, Result};
use fim_common::types::{Distribution, Token};
use serde::{Deserialize, Serialize};

use self::graph::RecipeGraph;

const APK_INSTALL: &[&str] = &["add", "--no-cache", "--update-cache", "--no-progress"];
const PACMAN_INSTALL: &[&str] = &["-Syu", "--noconfirm", "--needed"];

/// A recipe document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Short description.
    pub description: String,
    /// Packages installed by this recipe.
    pub packages: Vec<String>,
    /// Recipes installed before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Where recipe documents are downloaded from.
pub trait RecipeSource {
    /// Fetches the body at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or is not successful.
    fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// Downloads over HTTP(S).
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpSource;

impl RecipeSource for HttpSource {
    fn download(&self, url: &str) -> Result<Vec<u8>> {
        tracing::info!(url, "downloading recipe");
        let response = reqwest::blocking::get(url).map_err(|e| FimError::Config {
            message: format!("failed to download {url}: {e}"),
        })?;
        if !response.status().is_success() {
            return Err(FimError::Config {
                message: format!("HTTP {} downloading {url}", response.status()),
            });
        }
        let bytes = response.bytes().map_err(|e| FimError::Config {
            message: format!("failed to read response body from {url}: {e}"),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Local recipe cache of one distribution.
#[derive(Debug, Clone)]
pub struct RecipeBook {
    dir: PathBuf,
    distribution: Distribution,
}

impl RecipeBook {
    /// Opens the recipe cache for the configured distribution.
    #[must_use]
    pub fn new(config: &FimConfig) -> Self {
        Self {
            dir: config.recipes_dir(),
            distribution: config.distribution,
        }
    }

    /// Cache path of recipe `name`.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Loads a fetched recipe.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the recipe has not been fetched, or an error
    /// if it cannot be read or parsed.
    pub fn load(&self, name: &str) -> Result<Recipe> {
        validate_name(name)?;
        let path = self.path(name);
        if !path.exists() {
            return Err(FimError::usage(format!(
                "Recipe '{name}' not found locally. Use 'fim-recipe fetch {name}' first."
            )));
        }
        let raw = std::fs::read(&path).map_err(|e| FimError::io(&path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Fetches `names` and their dependency closure.
    ///
    /// With `use_existing`, recipes already in the cache are not downloaded
    /// again. Returns every recipe of the closure, dependencies first.
    ///
    /// # Errors
    ///
    /// Returns an error if a download is needed without a remote, a
    /// download fails, a document is invalid, or the dependencies form a
    /// cycle.
    pub fn fetch<S: AsRef<str>>(
        &self,
        source: &dyn RecipeSource,
        remote: Option<&str>,
        names: &[S],
        use_existing: bool,
    ) -> Result<Vec<String>> {
        let mut graph = RecipeGraph::new();
        let mut seen = HashSet::new();
        let mut pending: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();

        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let _ = graph.add_recipe(&name);
            let recipe = self.obtain(source, remote, &name, use_existing)?;
            for dependency in &recipe.dependencies {
                graph.add_dependency(&name, dependency);
                if !seen.contains(dependency) {
                    pending.push(dependency.clone());
                }
            }
        }
        graph.install_order()
    }

    /// Human-readable summary of a fetched recipe.
    ///
    /// # Errors
    ///
    /// See [`RecipeBook::load`].
    pub fn info(&self, name: &str) -> Result<Vec<String>> {
        let recipe = self.load(name)?;
        let mut lines = vec![
            format!("Recipe: {name}"),
            format!("Location: {}", self.path(name).display()),
            format!("Description: {}", recipe.description),
            format!("Package count: {}", recipe.packages.len()),
            "Packages:".to_string(),
        ];
        lines.extend(recipe.packages.iter().map(|p| format!("  - {p}")));
        lines.push(format!("Dependencies: {}", recipe.dependencies.len()));
        lines.extend(recipe.dependencies.iter().map(|d| format!("  - {d}")));
        Ok(lines)
    }

    /// Package manager invocation installing every package of `recipes`, in
    /// the given order.
    ///
    /// # Errors
    ///
    /// Returns a usage error for distributions without a package manager,
    /// or if a recipe has not been fetched.
    pub fn install_command<S: AsRef<str>>(&self, recipes: &[S]) -> Result<(String, Vec<String>)> {
        let (program, base): (&str, &[&str]) = match self.distribution {
            Distribution::Alpine => ("apk", APK_INSTALL),
            Distribution::Arch => ("pacman", PACMAN_INSTALL),
            Distribution::Blueprint => {
                return Err(FimError::usage("Blueprint does not support recipes"));
            }
        };
        let mut args: Vec<String> = base.iter().map(|a| (*a).to_string()).collect();
        for name in recipes {
            args.extend(self.load(name.as_ref())?.packages);
        }
        tracing::debug!(program, packages = args.len() - base.len(), "install command resolved");
        Ok((program.to_string(), args))
    }

    fn obtain(
        &self,
        source: &dyn RecipeSource,
        remote: Option<&str>,
        name: &str,
        use_existing: bool,
    ) -> Result<Recipe> {
        validate_name(name)?;
        let path = self.path(name);
        if use_existing && path.exists() {
            tracing::info!(path = %path.display(), "using existing recipe");
            return self.load(name);
        }

        let remote = remote.ok_or_else(|| FimError::usage("No remote URL configured"))?;
        let url = format!(
            "{}/{}/latest/{name}.json",
            remote.trim_end_matches('/'),
            self.distribution.name()
        );
        let body = source.download(&url)?;
        let recipe: Recipe = serde_json::from_slice(&body)?;

        std::fs::create_dir_all(&self.dir).map_err(|e| FimError::io(&self.dir, e))?;
        let tmp = self.dir.join(format!(".{name}.{}.tmp", std::process::id()));
        std::fs::write(&tmp, &body).map_err(|e| FimError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| FimError::io(&path, e))?;
        tracing::info!(recipe = name, path = %path.display(), "recipe downloaded");
        Ok(recipe)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(FimError::usage(format!("Invalid recipe name '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;

    const REMOTE: &str = "https://recipes.example/";

    #[derive(Default)]
    struct FakeSource {
        bodies: HashMap<String, String>,
        requested: RefCell<Vec<String>>,
    }

    impl FakeSource {
        fn with(mut self, name: &str, packages: &[&str], deps: &[&str]) -> Self {
            let recipe = Recipe {
                description: format!("{name} recipe"),
                packages: packages.iter().map(|p| (*p).to_string()).collect(),
                dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            };
            let url = format!("https://recipes.example/alpine/latest/{name}.json");
            let _ = self
                .bodies
                .insert(url, serde_json::to_string(&recipe).expect("json"));
            self
        }
    }

    impl RecipeSource for FakeSource {
        fn download(&self, url: &str) -> Result<Vec<u8>> {
            self.requested.borrow_mut().push(url.to_string());
            self.bodies
                .get(url)
                .map(|b| b.as_bytes().to_vec())
                .ok_or_else(|| FimError::Config {
                    message: format!("HTTP 404 Not Found downloading {url}"),
                })
        }
    }

    fn book() -> (tempfile::TempDir, RecipeBook) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = FimConfig::new(dir.path().join("app"), dir.path().join("data"));
        let book = RecipeBook::new(&config);
        (dir, book)
    }

    #[test]
    fn fetch_resolves_dependency_closure_in_order() {
        let (_dir, book) = book();
        let source = FakeSource::default()
            .with("gpu", &["mesa"], &["xorg"])
            .with("xorg", &["xorg-server"], &["fonts"])
            .with("fonts", &["font-noto"], &[]);

        let order = book.fetch(&source, Some(REMOTE), &["gpu"], false).expect("fetch");
        assert_eq!(order, vec!["fonts", "xorg", "gpu"]);
        assert!(book.path("fonts").exists());
        assert_eq!(book.load("gpu").expect("load").packages, vec!["mesa"]);
    }

    #[test]
    fn cycle_fails_without_unbounded_recursion() {
        let (_dir, book) = book();
        let source = FakeSource::default()
            .with("a", &["pa"], &["b"])
            .with("b", &["pb"], &["a"]);
        let err = book.fetch(&source, Some(REMOTE), &["a"], false).unwrap_err();
        assert!(
            err.to_string().starts_with("cyclic dependency detected for recipe '"),
            "got: {err}"
        );
        assert_eq!(source.requested.borrow().len(), 2);
    }

    #[test]
    fn existing_recipes_are_reused() {
        let (_dir, book) = book();
        let source = FakeSource::default().with("audio", &["pipewire"], &[]);
        let _ = book.fetch(&source, Some(REMOTE), &["audio"], false).expect("fetch");
        let _ = book.fetch(&source, None, &["audio"], true).expect("reuse");
        assert_eq!(source.requested.borrow().len(), 1);
    }

    #[test]
    fn missing_remote_is_reported() {
        let (_dir, book) = book();
        let err = book
            .fetch(&FakeSource::default(), None, &["audio"], true)
            .unwrap_err();
        assert_eq!(err.to_string(), "No remote URL configured");
    }

    #[test]
    fn install_command_concatenates_packages() {
        let (_dir, book) = book();
        let source = FakeSource::default()
            .with("fonts", &["font-noto"], &[])
            .with("xorg", &["xorg-server", "xauth"], &["fonts"]);
        let order = book.fetch(&source, Some(REMOTE), &["xorg"], false).expect("fetch");
        let (program, args) = book.install_command(&order).expect("install");
        assert_eq!(program, "apk");
        assert_eq!(
            args,
            vec![
                "add",
                "--no-cache",
                "--update-cache",
                "--no-progress",
                "font-noto",
                "xorg-server",
                "xauth"
            ]
        );
    }

    #[test]
    fn unfetched_recipe_points_at_fetch() {
        let (_dir, book) = book();
        let err = book.info("audio").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Recipe 'audio' not found locally. Use 'fim-recipe fetch audio' first."
        );
    }

    #[test]
    fn info_lists_packages_and_dependencies() {
        let (_dir, book) = book();
        let source = FakeSource::default()
            .with("base", &["busybox"], &[])
            .with("web", &["curl", "wget"], &["base"]);
        let _ = book.fetch(&source, Some(REMOTE), &["web"], false).expect("fetch");
        let lines = book.info("web").expect("info");
        assert!(lines.contains(&"Package count: 2".to_string()));
        assert!(lines.contains(&"  - wget".to_string()));
        assert!(lines.contains(&"Dependencies: 1".to_string()));
    }

    #[test]
    fn path_traversal_names_are_rejected() {
        let (_dir, book) = book();
        assert!(book.load("../etc/passwd").is_err());
    }
}
