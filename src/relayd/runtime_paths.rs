//! Runtime state directory resolution: keeps only the workdir half
//! (PID/state files for a future CLI feature) — there is no middleware
//! directory to resolve alongside it.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;

pub fn resolve_workdir(flag_or_env: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let mut wd = match flag_or_env {
        Some(p) => {
            if p.as_os_str().is_empty() {
                anyhow::bail!("workdir: empty path");
            }
            if p.is_relative() {
                std::env::current_dir().context("workdir: resolve cwd")?.join(p)
            } else {
                p
            }
        }
        None => default_workdir()?,
    };

    wd = normalize_path(wd);
    if wd.as_os_str().is_empty() {
        anyhow::bail!("workdir: empty path");
    }
    Ok(wd)
}

fn default_workdir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/var/lib/relayd"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "relayd", "relayd").context("workdir: resolve user data dir")?;
        Ok(proj.data_local_dir().to_path_buf())
    }
}

fn normalize_path(p: PathBuf) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        if matches!(c, Component::CurDir) {
            continue;
        }
        out.push(c.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_drops_current_dir_segments() {
        let p = PathBuf::from("./a/./b");
        assert_eq!(normalize_path(p), PathBuf::from("a/b"));
    }

    #[test]
    fn resolve_workdir_joins_relative_flag_to_cwd() {
        let wd = resolve_workdir(Some(PathBuf::from("relative/dir"))).unwrap();
        assert!(wd.ends_with("relative/dir"));
        assert!(wd.is_absolute());
    }
}
