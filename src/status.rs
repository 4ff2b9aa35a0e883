// Host health checks
//
// Each check tries to create, write and remove a probe file in a directory.
// "/" is always checked as writableRoot; extra paths are numbered from 1.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::error;

const PROBE_FILE: &str = "logrelay-ro.check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCheckResult {
    pub name: String,
    pub successful: bool,
    pub err: Option<String>,
}

struct WritableCheck {
    path: PathBuf,
}

impl WritableCheck {
    fn run(&self) -> io::Result<()> {
        let probe = self.path.join(PROBE_FILE);
        let result = write_probe(&probe);
        let _ = std::fs::remove_file(&probe);
        result
    }
}

fn write_probe(path: &Path) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    file.write_all(b"ok")?;
    file.sync_all()
}

pub struct CheckCollection {
    checks: Vec<(String, WritableCheck)>,
}

impl CheckCollection {
    pub fn new(extra_paths: &[PathBuf]) -> Self {
        let mut checks = vec![(
            "writableRoot".to_string(),
            WritableCheck {
                path: PathBuf::from("/"),
            },
        )];
        for (i, path) in extra_paths.iter().enumerate() {
            checks.push((
                format!("writableCustomPath{}", i + 1),
                WritableCheck { path: path.clone() },
            ));
        }
        Self { checks }
    }

    pub fn run(&self) -> Vec<HostCheckResult> {
        self.checks
            .iter()
            .map(|(name, check)| match check.run() {
                Ok(()) => HostCheckResult {
                    name: name.clone(),
                    successful: true,
                    err: None,
                },
                Err(e) => {
                    error!(check = %name, error = %e, "Host check failed");
                    HostCheckResult {
                        name: name.clone(),
                        successful: false,
                        err: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }
}
