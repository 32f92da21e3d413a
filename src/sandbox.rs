//! Bubblewrap argv construction for sandboxed terraform invocations.
//!
//! Only `terraform apply` is sandboxed: it is the one step that can mutate
//! real infrastructure, so it runs with nothing but the binary, the working
//! directory, DNS and CA certificates visible. The builder is a pure argv
//! transformation; spawning stays in the operation, so tests don't need
//! bwrap installed.

use std::path::Path;

const RESOLV_CONF: &str = "/etc/resolv.conf";
const CA_CERTS: &str = "/etc/ssl/certs/ca-certificates.crt";
const SANDBOX_CONFIG_DIR: &str = "/config";

/// Wrap a terraform invocation in a bwrap sandbox.
///
/// `args` is the literal argv with the terraform binary path first. `root`
/// is the working directory root bound read-write at `/config`; `relative`
/// is the sub-path within it that terraform runs from. When `plugin_cache`
/// is set, the shared plugin cache directory is additionally bound
/// read-only at its host path.
pub fn wrap(
    args: &[String],
    root: &Path,
    relative: &str,
    plugin_cache: Option<&Path>,
) -> Vec<String> {
    let binary = Path::new(&args[0]);
    let base = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args[0].clone());
    let chdir = if relative.is_empty() {
        SANDBOX_CONFIG_DIR.to_string()
    } else {
        format!("{}/{}", SANDBOX_CONFIG_DIR, relative)
    };

    let mut wrapped = vec![
        "bwrap".to_string(),
        "--ro-bind".to_string(),
        args[0].clone(),
        format!("/bin/{}", base),
        "--bind".to_string(),
        root.to_string_lossy().into_owned(),
        SANDBOX_CONFIG_DIR.to_string(),
        // for DNS lookups
        "--ro-bind".to_string(),
        RESOLV_CONF.to_string(),
        RESOLV_CONF.to_string(),
        // for verifying SSL connections
        "--ro-bind".to_string(),
        CA_CERTS.to_string(),
        CA_CERTS.to_string(),
        "--chdir".to_string(),
        chdir,
        // terraform v1.0.10 (but not v1.2.2) reads /proc/self/exe
        "--proc".to_string(),
        "/proc".to_string(),
        // avoids provider error "failed to read schema..."
        "--tmpfs".to_string(),
        "/tmp".to_string(),
    ];
    if let Some(cache) = plugin_cache {
        let cache = cache.to_string_lossy().into_owned();
        wrapped.push("--ro-bind".to_string());
        wrapped.push(cache.clone());
        wrapped.push(cache);
    }
    wrapped.push(base);
    wrapped.extend(args[1..].iter().cloned());
    wrapped
}
