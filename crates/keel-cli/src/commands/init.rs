use std::path::{Path, PathBuf};

use keel_core::KeelConfig;

pub fn init(path: &str, name: Option<&str>, image: Option<&str>, force: bool) -> anyhow::Result<()> {
    let output = write_scaffold(Path::new(path), name, image, force)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}

fn write_scaffold(
    dir: &Path,
    name: Option<&str>,
    image: Option<&str>,
    force: bool,
) -> anyhow::Result<PathBuf> {
    let output = dir.join("keel.toml");
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let name = match name {
        Some(name) => name.to_string(),
        None => dir
            .canonicalize()?
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("app")
            .to_string(),
    };
    let image = image
        .map(str::to_string)
        .unwrap_or_else(|| format!("registry.example.com/{name}"));

    let config = KeelConfig::scaffold(&name, &image);
    std::fs::write(&output, config.to_toml_string()?)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_parseable_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        let output = write_scaffold(dir.path(), Some("web"), None, false).unwrap();

        let config = KeelConfig::from_file(&output).unwrap();
        assert_eq!(config.target.name, "web");
        let builds = config.builds.unwrap();
        assert_eq!(
            builds.values().next().unwrap(),
            "registry.example.com/web:0000000"
        );
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        write_scaffold(dir.path(), Some("web"), None, false).unwrap();

        let err = write_scaffold(dir.path(), Some("api"), None, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        write_scaffold(dir.path(), Some("api"), Some("ghcr.io/acme/api"), true).unwrap();
        let config = KeelConfig::from_file(&dir.path().join("keel.toml")).unwrap();
        assert_eq!(config.target.name, "api");
    }
}
