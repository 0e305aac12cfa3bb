//! Connection provisioner: decides how the next start reaches the server.
//!
//! [`provision`] is a pure function of [`ServerSettings`]. It may look at the
//! filesystem to locate the server artifact and the Java executable, but it
//! never opens a connection or spawns anything.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;
use crate::retry::RetryPolicy;

/// Server artifact file name prefix inside the install directory.
pub const ARTIFACT_PREFIX: &str = "grails-language-server-";
/// Server artifact file name suffix inside the install directory.
pub const ARTIFACT_SUFFIX: &str = "-all.jar";

/// JDWP agent attached to a locally spawned server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugAgent {
    pub port: u16,
    pub suspend: bool,
}

impl Default for DebugAgent {
    fn default() -> Self {
        Self {
            port: 5005,
            suspend: false,
        }
    }
}

impl DebugAgent {
    #[must_use]
    pub fn jvm_arg(&self) -> String {
        let suspend = if self.suspend { "y" } else { "n" };
        format!(
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend={suspend},address={},quiet=y",
            self.port
        )
    }
}

/// Provisioning inputs, taken from configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Connect to an externally started server instead of spawning one.
    pub development_mode: bool,
    pub host: String,
    pub port: u16,
    pub retry: RetryPolicy,
    /// Java installation; when unset, `java` is resolved on `PATH`.
    pub java_home: Option<PathBuf>,
    pub jvm_args: Vec<String>,
    /// Directory holding the server artifact.
    pub install_dir: PathBuf,
    pub debug: Option<DebugAgent>,
    /// Extra environment on top of the inherited one.
    pub env: BTreeMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            development_mode: false,
            host: "localhost".to_string(),
            port: 5007,
            retry: RetryPolicy::default(),
            java_home: None,
            jvm_args: Vec::new(),
            install_dir: PathBuf::from("server"),
            debug: None,
            env: BTreeMap::new(),
        }
    }
}

/// How to reach the server for one start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Local(LocalSpec),
    Remote(RemoteSpec),
}

impl ConnectionSpec {
    /// Short human-readable target, for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Local(local) => format!("local process {}", local.program.display()),
            Self::Remote(remote) => format!("{}:{}", remote.host, remote.port),
        }
    }
}

/// Spawn a co-located server over stdio. Inherits the parent environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Dial a server listening on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub host: String,
    pub port: u16,
    pub retry: RetryPolicy,
}

/// Compute the connection spec for the next start attempt.
pub fn provision(
    settings: &ServerSettings,
    project_root: Option<&Path>,
) -> Result<ConnectionSpec, ProvisionError> {
    if settings.development_mode {
        return Ok(ConnectionSpec::Remote(RemoteSpec {
            host: settings.host.clone(),
            port: settings.port,
            retry: settings.retry.clone(),
        }));
    }

    let jar = find_server_artifact(&settings.install_dir)?;
    let program = resolve_java(settings.java_home.as_deref())?;

    let mut args = settings.jvm_args.clone();
    if let Some(debug) = &settings.debug {
        args.push(debug.jvm_arg());
    }
    args.push("-jar".to_string());
    args.push(jar.to_string_lossy().into_owned());

    let mut env = settings.env.clone();
    if let Some(java_home) = &settings.java_home {
        env.insert(
            "JAVA_HOME".to_string(),
            java_home.to_string_lossy().into_owned(),
        );
    }

    Ok(ConnectionSpec::Local(LocalSpec {
        program,
        args,
        env,
        cwd: project_root.map(Path::to_path_buf),
    }))
}

/// Locate the single `grails-language-server-*-all.jar` in `dir`.
///
/// Several matches resolve to the lexicographically last one, so the newest
/// version wins when versions share a width.
fn find_server_artifact(dir: &Path) -> Result<PathBuf, ProvisionError> {
    let entries =
        fs::read_dir(dir).map_err(|_| ProvisionError::MissingInstallDir(dir.to_path_buf()))?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_SUFFIX)
                    })
        })
        .collect();
    candidates.sort();

    let jar = candidates
        .pop()
        .ok_or_else(|| ProvisionError::MissingArtifact {
            dir: dir.to_path_buf(),
            pattern: format!("{ARTIFACT_PREFIX}*{ARTIFACT_SUFFIX}"),
        })?;
    tracing::debug!(jar = %jar.display(), "Found language server artifact");
    Ok(jar)
}

fn resolve_java(java_home: Option<&Path>) -> Result<PathBuf, ProvisionError> {
    let executable = if cfg!(windows) { "java.exe" } else { "java" };
    match java_home {
        Some(home) => {
            let candidate = home.join("bin").join(executable);
            if candidate.is_file() {
                Ok(candidate)
            } else {
                Err(ProvisionError::ExecutableNotFound {
                    command: candidate.display().to_string(),
                    reason: "not a file".to_string(),
                })
            }
        }
        None => which::which(executable).map_err(|e| ProvisionError::ExecutableNotFound {
            command: executable.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_java_home(root: &Path) -> PathBuf {
        let home = root.join("jdk");
        let bin = home.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let exe = if cfg!(windows) { "java.exe" } else { "java" };
        fs::write(bin.join(exe), b"").unwrap();
        home
    }

    fn local_settings(root: &Path) -> ServerSettings {
        let install_dir = root.join("server");
        fs::create_dir_all(&install_dir).unwrap();
        ServerSettings {
            java_home: Some(fake_java_home(root)),
            install_dir,
            ..ServerSettings::default()
        }
    }

    #[test]
    fn development_mode_yields_remote_spec() {
        let settings = ServerSettings {
            development_mode: true,
            host: "devbox".to_string(),
            port: 6000,
            ..ServerSettings::default()
        };
        let spec = provision(&settings, None).unwrap();
        let ConnectionSpec::Remote(remote) = spec else {
            panic!("expected remote spec");
        };
        assert_eq!(remote.host, "devbox");
        assert_eq!(remote.port, 6000);
        assert_eq!(remote.retry, RetryPolicy::default());
    }

    #[test]
    fn development_mode_does_not_touch_install_dir() {
        let settings = ServerSettings {
            development_mode: true,
            install_dir: PathBuf::from("/definitely/not/here"),
            ..ServerSettings::default()
        };
        assert!(provision(&settings, None).is_ok());
    }

    #[test]
    fn local_spec_orders_jvm_args_debug_agent_then_jar() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = local_settings(dir.path());
        settings.jvm_args = vec!["-Xmx2g".to_string()];
        settings.debug = Some(DebugAgent::default());
        let jar = settings.install_dir.join("grails-language-server-1.2.0-all.jar");
        fs::write(&jar, b"").unwrap();

        let spec = provision(&settings, Some(dir.path())).unwrap();
        let ConnectionSpec::Local(local) = spec else {
            panic!("expected local spec");
        };
        assert_eq!(
            local.args,
            vec![
                "-Xmx2g".to_string(),
                "-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=5005,quiet=y"
                    .to_string(),
                "-jar".to_string(),
                jar.to_string_lossy().into_owned(),
            ]
        );
        assert!(local.program.starts_with(dir.path()));
        assert!(local.env.contains_key("JAVA_HOME"));
        assert_eq!(local.cwd.as_deref(), Some(dir.path()));
    }

    #[test]
    fn missing_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        fs::write(settings.install_dir.join("README.txt"), b"").unwrap();

        let err = provision(&settings, None).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingArtifact { .. }));
        assert!(err.to_string().contains("grails-language-server-*-all.jar"));
    }

    #[test]
    fn missing_install_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            install_dir: dir.path().join("absent"),
            ..ServerSettings::default()
        };
        assert!(matches!(
            provision(&settings, None),
            Err(ProvisionError::MissingInstallDir(_))
        ));
    }

    #[test]
    fn java_home_without_executable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = local_settings(dir.path());
        fs::write(
            settings.install_dir.join("grails-language-server-1.0-all.jar"),
            b"",
        )
        .unwrap();
        settings.java_home = Some(dir.path().join("empty-jdk"));

        assert!(matches!(
            provision(&settings, None),
            Err(ProvisionError::ExecutableNotFound { .. })
        ));
    }

    #[test]
    fn newest_artifact_wins_among_several() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        for version in ["1.0.0", "1.2.0", "1.1.0"] {
            fs::write(
                settings
                    .install_dir
                    .join(format!("grails-language-server-{version}-all.jar")),
                b"",
            )
            .unwrap();
        }

        let ConnectionSpec::Local(local) = provision(&settings, None).unwrap() else {
            panic!("expected local spec");
        };
        assert!(local.args.last().unwrap().ends_with("grails-language-server-1.2.0-all.jar"));
    }

    #[test]
    fn debug_agent_suspend_flag() {
        let agent = DebugAgent {
            port: 8000,
            suspend: true,
        };
        assert!(agent.jvm_arg().contains("suspend=y,address=8000"));
    }
}
