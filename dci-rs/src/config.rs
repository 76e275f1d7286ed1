use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::api::DEFAULT_CS_URL;

/// System-wide configuration file, shared with the other DCI tools.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/dci/dci.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing or incomplete credentials.")]
    MissingCredentials,
    #[error(transparent)]
    Figment(#[from] figment::Error),
}

/// Connection settings and run identifiers.
///
/// Every field can be set from the environment with a `DCI_` prefix, e.g.
/// `DCI_CS_URL` or `DCI_JOB_ID`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DciConfig {
    pub cs_url: String,
    pub login: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub api_secret: Option<String>,
    /// Job of an interrupted run to resume reporting to.
    pub job_id: Option<Uuid>,
    pub jobstate_id: Option<Uuid>,
    pub remoteci: Option<String>,
    pub topic: Option<String>,
}

impl Default for DciConfig {
    fn default() -> Self {
        DciConfig {
            cs_url: DEFAULT_CS_URL.to_string(),
            login: None,
            password: None,
            client_id: None,
            api_secret: None,
            job_id: None,
            jobstate_id: None,
            remoteci: None,
            topic: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// User login and password, sent as HTTP Basic authentication.
    Login { login: String, password: String },
    /// Remote CI or feeder client id and API secret.
    Signature { client_id: String, api_secret: String },
}

impl DciConfig {
    /// Login/password take precedence over client id/API secret. Empty
    /// values count as missing.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        fn non_empty(value: &Option<String>) -> Option<&String> {
            value.as_ref().filter(|v| !v.is_empty())
        }

        if let (Some(login), Some(password)) = (non_empty(&self.login), non_empty(&self.password)) {
            return Ok(Credentials::Login {
                login: login.clone(),
                password: password.clone(),
            });
        }
        if let (Some(client_id), Some(api_secret)) =
            (non_empty(&self.client_id), non_empty(&self.api_secret))
        {
            return Ok(Credentials::Signature {
                client_id: client_id.clone(),
                api_secret: api_secret.clone(),
            });
        }
        Err(ConfigError::MissingCredentials)
    }

    /// Build the layered configuration: defaults, then the system YAML file,
    /// then `path` (TOML), then `DCI_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(DciConfig::default()))
            .merge(Yaml::file(SYSTEM_CONFIG_FILE));

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(Env::prefixed("DCI_"))
    }

    pub fn load(path: Option<&Path>) -> Result<DciConfig, ConfigError> {
        Ok(DciConfig::figment(path).extract()?)
    }
}

/// Settings of the JUnit report callback, read from `JUNIT_*` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JunitConfig {
    pub output_dir: PathBuf,
    /// One class per YAML file instead of one per task.
    pub task_class: bool,
    pub task_relative_path: Option<PathBuf>,
    pub replace_out_of_tree_path: Option<String>,
    pub fail_on_change: bool,
    pub fail_on_ignore: bool,
    pub include_setup_tasks_in_report: bool,
    pub hide_task_arguments: bool,
    /// Only tasks matching this (case-insensitive) expression become test
    /// cases. Empty means none.
    pub test_case_regex: String,
    /// Starting a task whose name contains this writes the report early.
    pub generate_task_name: String,
}

impl Default for JunitConfig {
    fn default() -> Self {
        JunitConfig {
            output_dir: std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join(".ansible.log"),
            task_class: false,
            task_relative_path: None,
            replace_out_of_tree_path: None,
            fail_on_change: false,
            fail_on_ignore: false,
            include_setup_tasks_in_report: true,
            hide_task_arguments: false,
            test_case_regex: String::new(),
            generate_task_name: "Verify mandatory tests".to_string(),
        }
    }
}

impl JunitConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(JunitConfig::default())).merge(Env::prefixed("JUNIT_"))
    }

    pub fn load() -> Result<JunitConfig, ConfigError> {
        Ok(JunitConfig::figment().extract()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_point_at_public_server() {
        Jail::expect_with(|_jail| {
            let config: DciConfig = DciConfig::figment(None).extract()?;
            assert_eq!(config.cs_url, DEFAULT_CS_URL);
            assert!(config.job_id.is_none());
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dci.toml",
                r#"
                cs_url = "https://file.example"
                login = "file-user"
                password = "file-pass"
                "#,
            )?;
            jail.set_env("DCI_CS_URL", "https://env.example");
            jail.set_env("DCI_JOB_ID", "6a0c2c0e-4a5c-4f38-9a8f-6d3d0c1b2a11");

            let config: DciConfig = DciConfig::figment(Some(Path::new("dci.toml"))).extract()?;
            assert_eq!(config.cs_url, "https://env.example");
            assert_eq!(config.login.as_deref(), Some("file-user"));
            assert_eq!(
                config.job_id.map(|id| id.to_string()).as_deref(),
                Some("6a0c2c0e-4a5c-4f38-9a8f-6d3d0c1b2a11")
            );
            Ok(())
        });
    }

    #[test]
    fn login_wins_over_signature() {
        let mut config = DciConfig {
            client_id: Some("remoteci/1".into()),
            api_secret: Some("secret".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.credentials(),
            Ok(Credentials::Signature { .. })
        ));

        config.login = Some("admin".into());
        config.password = Some("admin".into());
        assert_eq!(
            config.credentials().unwrap(),
            Credentials::Login {
                login: "admin".into(),
                password: "admin".into()
            }
        );

        config.password = Some(String::new());
        assert!(matches!(
            config.credentials(),
            Ok(Credentials::Signature { .. })
        ));
    }

    #[test]
    fn no_credentials_is_an_error() {
        assert!(matches!(
            DciConfig::default().credentials(),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[test]
    fn junit_flags_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("JUNIT_FAIL_ON_CHANGE", "true");
            jail.set_env("JUNIT_TEST_CASE_REGEX", "^check");
            let config: JunitConfig = JunitConfig::figment().extract()?;
            assert!(config.fail_on_change);
            assert!(config.include_setup_tasks_in_report);
            assert_eq!(config.test_case_regex, "^check");
            Ok(())
        });
    }
}
