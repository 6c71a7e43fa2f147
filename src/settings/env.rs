//! Environment placeholder expansion for stdio upstreams.
//!
//! `${NAME}` in configured env values and args is replaced from the process
//! environment at connect time; `$PATH`-style references inside `PATH` are
//! expanded the same way.

use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;

use super::{InstallConfig, ServerConfig};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

/// Replace `${NAME}` / `$NAME` with the process env value, or the empty
/// string when unset.
pub fn expand_placeholders(input: &str) -> String {
    placeholder_re()
        .replace_all(input, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

const PYTHON_COMMANDS: &[&str] = &["uvx", "uv", "python", "python3"];
const NODE_COMMANDS: &[&str] = &["npm", "npx", "pnpm", "yarn", "node"];

/// Build the child environment for a stdio upstream: expanded configured
/// values on top of the inherited `PATH`, plus package-registry overrides for
/// Python and Node launchers when the operator configured them.
pub fn build_child_env(config: &ServerConfig, install: &InstallConfig) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = HashMap::with_capacity(config.env.len() + 3);

    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }

    for (key, value) in &config.env {
        env.insert(key.clone(), expand_placeholders(value));
    }

    let command = config.command.as_deref().unwrap_or_default();
    let launcher = command.rsplit(['/', '\\']).next().unwrap_or(command);

    if PYTHON_COMMANDS.contains(&launcher) {
        if let Some(index_url) = install.python_index_url.as_deref().filter(|u| !u.is_empty()) {
            env.entry("UV_DEFAULT_INDEX".to_string())
                .or_insert_with(|| index_url.to_string());
        }
    }
    if NODE_COMMANDS.contains(&launcher) {
        if let Some(registry) = install.npm_registry.as_deref().filter(|u| !u.is_empty()) {
            env.entry("npm_config_registry".to_string())
                .or_insert_with(|| registry.to_string());
        }
    }

    env
}

/// Expand placeholders in every configured arg.
pub fn expand_args(config: &ServerConfig) -> Vec<String> {
    config.args.iter().map(|a| expand_placeholders(a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn stdio_config(command: &str) -> ServerConfig {
        ServerConfig {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[test]
    #[serial]
    fn test_expand_placeholders() {
        std::env::set_var("HUB_TEST_TOKEN", "abc123");
        assert_eq!(expand_placeholders("${HUB_TEST_TOKEN}"), "abc123");
        assert_eq!(expand_placeholders("key=${HUB_TEST_TOKEN}!"), "key=abc123!");
        assert_eq!(expand_placeholders("$HUB_TEST_TOKEN"), "abc123");
        std::env::remove_var("HUB_TEST_TOKEN");

        // Unset variables expand to empty.
        std::env::remove_var("HUB_TEST_MISSING");
        assert_eq!(expand_placeholders("x${HUB_TEST_MISSING}y"), "xy");

        // Literal text untouched.
        assert_eq!(expand_placeholders("plain value"), "plain value");
    }

    #[test]
    #[serial]
    fn test_path_expansion_in_env() {
        std::env::set_var("PATH", "/usr/bin:/bin");
        let mut config = stdio_config("some-tool");
        config
            .env
            .insert("PATH".to_string(), "/opt/tools:$PATH".to_string());

        let env = build_child_env(&config, &InstallConfig::default());
        assert_eq!(env.get("PATH").unwrap(), "/opt/tools:/usr/bin:/bin");
    }

    #[test]
    #[serial]
    fn test_registry_injection_python() {
        let install = InstallConfig {
            python_index_url: Some("https://pypi.internal/simple".into()),
            npm_registry: Some("https://npm.internal".into()),
            base_url: None,
        };

        let env = build_child_env(&stdio_config("uvx"), &install);
        assert_eq!(
            env.get("UV_DEFAULT_INDEX").unwrap(),
            "https://pypi.internal/simple"
        );
        assert!(!env.contains_key("npm_config_registry"));
    }

    #[test]
    #[serial]
    fn test_registry_injection_node() {
        let install = InstallConfig {
            python_index_url: None,
            npm_registry: Some("https://npm.internal".into()),
            base_url: None,
        };

        let env = build_child_env(&stdio_config("npx"), &install);
        assert_eq!(env.get("npm_config_registry").unwrap(), "https://npm.internal");

        // Absolute launcher paths still match.
        let env = build_child_env(&stdio_config("/usr/local/bin/node"), &install);
        assert!(env.contains_key("npm_config_registry"));

        // Configured env wins over injection.
        let mut config = stdio_config("npm");
        config
            .env
            .insert("npm_config_registry".to_string(), "https://other".to_string());
        let env = build_child_env(&config, &install);
        assert_eq!(env.get("npm_config_registry").unwrap(), "https://other");
    }

    #[test]
    #[serial]
    fn test_no_injection_for_other_commands() {
        let install = InstallConfig {
            python_index_url: Some("https://pypi.internal/simple".into()),
            npm_registry: Some("https://npm.internal".into()),
            base_url: None,
        };

        let env = build_child_env(&stdio_config("./custom-server"), &install);
        assert!(!env.contains_key("UV_DEFAULT_INDEX"));
        assert!(!env.contains_key("npm_config_registry"));
    }
}
