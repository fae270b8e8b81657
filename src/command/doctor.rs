use std::path::PathBuf;

use anyhow::Result;

use crate::config::{ContainerRuntime, RunConfig};
use crate::logger;
use crate::sandbox::{BackendRequest, resolve_backend, runtime_available};

pub fn run(config_path: Option<&PathBuf>) -> Result<()> {
    let config = RunConfig::load_or_default(config_path)?;
    let runtime = config.sandbox.runtime();

    for line in report(runtime, runtime_available(runtime))? {
        println!("{line}");
    }
    println!("log: {}", logger::log_path()?.display());
    Ok(())
}

fn report(runtime: ContainerRuntime, available: bool) -> Result<Vec<String>> {
    let default_backend = resolve_backend(BackendRequest::Auto, None, None, available)?;
    Ok(vec![
        format!(
            "{}: {}",
            runtime.binary(),
            if available { "available" } else { "not available" }
        ),
        "local: available".to_string(),
        format!("default_backend: {}", default_backend.kind.as_str()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_runtime_defaults_to_local() {
        let lines = report(ContainerRuntime::Docker, false).unwrap();
        assert_eq!(
            lines,
            vec![
                "docker: not available",
                "local: available",
                "default_backend: local"
            ]
        );
    }

    #[test]
    fn available_runtime_defaults_to_container() {
        let lines = report(ContainerRuntime::Podman, true).unwrap();
        assert_eq!(lines[0], "podman: available");
        assert_eq!(lines[2], "default_backend: container");
    }
}
