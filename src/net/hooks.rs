//! Hook points around network setup. Executable scripts under
//! `<HOOKS_DIR>/<point>/` run in name order; each receives the request as a
//! JSON file named by the `_hook_json` environment variable and may mutate
//! it in place. A missing hook directory means no hooks.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Error};
use log::debug;
use serde_json::{json, Value};

use osutils::exe::RunAndCheck;
use vhostd_api::constants::HOOKS_DIR;
use vhostd_api::request::SetupRequest;

const HOOK_JSON_ENV: &str = "_hook_json";

/// Runs the `before_network_setup` hook point and folds script mutations
/// back into the request.
pub fn before_network_setup(request: &mut SetupRequest) -> Result<(), Error> {
    let payload = run_hooks_dir(
        &Path::new(HOOKS_DIR).join("before_network_setup"),
        hook_payload(request)?,
    )?;
    *request = request_from_payload(payload)?;
    Ok(())
}

/// Runs the `after_network_setup` hook point. Mutations are ignored.
pub fn after_network_setup(request: &SetupRequest) -> Result<(), Error> {
    run_hooks_dir(
        &Path::new(HOOKS_DIR).join("after_network_setup"),
        hook_payload(request)?,
    )?;
    Ok(())
}

fn hook_payload(request: &SetupRequest) -> Result<Value, Error> {
    Ok(json!({
        "request": {
            "networks": serde_json::to_value(&request.networks)?,
            "bondings": serde_json::to_value(&request.bondings)?,
            "options": serde_json::to_value(&request.options)?,
        }
    }))
}

fn request_from_payload(payload: Value) -> Result<SetupRequest, Error> {
    let request = payload
        .get("request")
        .cloned()
        .context("Hook dropped the request envelope")?;
    serde_json::from_value(request).context("Hook produced an unparsable request")
}

fn run_hooks_dir(dir: &Path, mut payload: Value) -> Result<Value, Error> {
    if !dir.exists() {
        return Ok(payload);
    }

    let mut scripts: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Could not list hooks in {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    scripts.sort();

    for script in scripts {
        debug!("Running hook {}", script.display());
        let mut data_file =
            tempfile::NamedTempFile::new().context("Failed to create hook data file")?;
        data_file
            .write_all(payload.to_string().as_bytes())
            .context("Failed to write hook data")?;

        Command::new(&script)
            .env(HOOK_JSON_ENV, data_file.path())
            .run_and_check()
            .with_context(|| format!("Hook {} failed", script.display()))?;

        let content = std::fs::read_to_string(data_file.path())
            .context("Failed to read back hook data")?;
        payload = serde_json::from_str(&content)
            .with_context(|| format!("Hook {} produced bad JSON", script.display()))?;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_missing_dir_is_noop() {
        let payload = json!({"request": {}});
        let result = run_hooks_dir(Path::new("/nonexistent/hooks"), payload.clone()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn test_passthrough_hook() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "10_noop", "true");
        let payload = json!({"request": {"networks": {}}});
        let result = run_hooks_dir(dir.path(), payload.clone()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn test_mutating_hook() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "10_patch",
            r#"sed -i 's/"old"/"new"/' "$_hook_json""#,
        );
        let payload = json!({"request": {"marker": "old"}});
        let result = run_hooks_dir(dir.path(), payload).unwrap();
        assert_eq!(result["request"]["marker"], "new");
    }

    #[test]
    fn test_failing_hook_raises() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "10_fail", "exit 3");
        let err = run_hooks_dir(dir.path(), json!({})).unwrap_err();
        assert!(format!("{err:#}").contains("failed"));
    }

    #[test]
    fn test_hooks_run_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "20_second",
            r#"sed -i 's/"a"/"ab"/' "$_hook_json""#,
        );
        write_script(
            dir.path(),
            "10_first",
            r#"sed -i 's/""/"a"/' "$_hook_json""#,
        );
        let result = run_hooks_dir(dir.path(), json!({"request": {"trace": ""}})).unwrap();
        assert_eq!(result["request"]["trace"], "ab");
    }
}
