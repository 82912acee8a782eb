//! Declarative driver flags and the typed values resolved from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::DriverError;

/// One configurable parameter advertised by a driver.
///
/// The `kind` tag travels with every descriptor so the shape survives the
/// plugin transport intact.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FlagDescriptor {
    /// A boolean switch.
    Bool {
        /// Flag name without leading dashes.
        name: String,
        /// Help text.
        usage: String,
        /// Value used when neither the user nor the environment sets one.
        #[serde(default)]
        default: bool,
        /// Environment variable consulted before the default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_var: Option<String>,
    },
    /// A signed integer.
    Int {
        /// Flag name without leading dashes.
        name: String,
        /// Help text.
        usage: String,
        /// Value used when neither the user nor the environment sets one.
        #[serde(default)]
        default: i64,
        /// Environment variable consulted before the default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_var: Option<String>,
    },
    /// A single string.
    String {
        /// Flag name without leading dashes.
        name: String,
        /// Help text.
        usage: String,
        /// Value used when neither the user nor the environment sets one.
        #[serde(default)]
        default: String,
        /// Environment variable consulted before the default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_var: Option<String>,
    },
    /// A repeatable string flag.
    StringList {
        /// Flag name without leading dashes.
        name: String,
        /// Help text.
        usage: String,
        /// Value used when neither the user nor the environment sets one.
        #[serde(default)]
        default: Vec<String>,
        /// Environment variable consulted before the default; values are
        /// comma separated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_var: Option<String>,
    },
}

impl FlagDescriptor {
    /// Builds a boolean flag defaulting to `false`.
    #[must_use]
    pub fn boolean(name: &str, usage: &str) -> Self {
        Self::Bool {
            name: name.to_owned(),
            usage: usage.to_owned(),
            default: false,
            env_var: None,
        }
    }

    /// Builds an integer flag.
    #[must_use]
    pub fn int(name: &str, usage: &str, default: i64) -> Self {
        Self::Int {
            name: name.to_owned(),
            usage: usage.to_owned(),
            default,
            env_var: None,
        }
    }

    /// Builds a string flag.
    #[must_use]
    pub fn string(name: &str, usage: &str, default: &str) -> Self {
        Self::String {
            name: name.to_owned(),
            usage: usage.to_owned(),
            default: default.to_owned(),
            env_var: None,
        }
    }

    /// Builds a repeatable string flag with an empty default.
    #[must_use]
    pub fn string_list(name: &str, usage: &str) -> Self {
        Self::StringList {
            name: name.to_owned(),
            usage: usage.to_owned(),
            default: Vec::new(),
            env_var: None,
        }
    }

    /// Attaches an environment variable to the descriptor.
    #[must_use]
    pub fn with_env(mut self, var: &str) -> Self {
        match &mut self {
            Self::Bool { env_var, .. }
            | Self::Int { env_var, .. }
            | Self::String { env_var, .. }
            | Self::StringList { env_var, .. } => *env_var = Some(var.to_owned()),
        }
        self
    }

    /// Returns the flag name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Bool { name, .. }
            | Self::Int { name, .. }
            | Self::String { name, .. }
            | Self::StringList { name, .. } => name,
        }
    }

    /// Returns the help text.
    #[must_use]
    pub fn usage(&self) -> &str {
        match self {
            Self::Bool { usage, .. }
            | Self::Int { usage, .. }
            | Self::String { usage, .. }
            | Self::StringList { usage, .. } => usage,
        }
    }

    /// Returns the environment variable name, if any.
    #[must_use]
    pub fn env_var(&self) -> Option<&str> {
        match self {
            Self::Bool { env_var, .. }
            | Self::Int { env_var, .. }
            | Self::String { env_var, .. }
            | Self::StringList { env_var, .. } => env_var.as_deref(),
        }
    }

    /// Returns the default as a typed value.
    #[must_use]
    pub fn default_value(&self) -> FlagValue {
        match self {
            Self::Bool { default, .. } => FlagValue::Bool(*default),
            Self::Int { default, .. } => FlagValue::Int(*default),
            Self::String { default, .. } => FlagValue::String(default.clone()),
            Self::StringList { default, .. } => FlagValue::StringList(default.clone()),
        }
    }

    fn parse(&self, raw: &[String]) -> Result<FlagValue, DriverError> {
        match self {
            Self::Bool { name, .. } => {
                let text = raw.last().map_or("true", String::as_str);
                parse_bool(text)
                    .map(FlagValue::Bool)
                    .ok_or_else(|| DriverError::config(format!("--{name} expects a boolean, got '{text}'")))
            }
            Self::Int { name, .. } => {
                let text = raw.last().map_or("", String::as_str);
                text.trim()
                    .parse::<i64>()
                    .map(FlagValue::Int)
                    .map_err(|_| DriverError::config(format!("--{name} expects an integer, got '{text}'")))
            }
            Self::String { .. } => Ok(FlagValue::String(raw.last().cloned().unwrap_or_default())),
            Self::StringList { .. } => Ok(FlagValue::StringList(raw.to_vec())),
        }
    }

    fn parse_env(&self, text: &str) -> Result<FlagValue, DriverError> {
        match self {
            Self::StringList { .. } => Ok(FlagValue::StringList(
                text.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_owned)
                    .collect(),
            )),
            _ => self.parse(&[text.to_owned()]),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// A typed flag value.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum FlagValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
    /// List of strings.
    StringList(Vec<String>),
}

/// Fully populated flag values handed to a driver's `configure` step.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverOptions {
    values: BTreeMap<String, FlagValue>,
}

impl DriverOptions {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, value: FlagValue) {
        self.values.insert(name.into(), value);
    }

    /// Sets a value and returns the option set.
    #[must_use]
    pub fn with(mut self, name: &str, value: FlagValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Returns the raw value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        self.values.get(name)
    }

    /// Returns the string value for `name`, or `None` when absent, empty, or
    /// of another kind.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(FlagValue::String(value)) if !value.trim().is_empty() => Some(value.as_str()),
            _ => None,
        }
    }

    /// Returns the integer value for `name`.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(FlagValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns the boolean value for `name`, `false` when absent.
    #[must_use]
    pub fn bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(FlagValue::Bool(true)))
    }

    /// Returns the list value for `name`, empty when absent.
    #[must_use]
    pub fn string_list(&self, name: &str) -> &[String] {
        match self.values.get(name) {
            Some(FlagValue::StringList(values)) => values,
            _ => &[],
        }
    }

    /// Resolves every descriptor into a typed value.
    ///
    /// For each flag the user value wins, then the descriptor's environment
    /// variable, then its default.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ConfigInvalid`] when the user passes a flag the
    /// driver does not declare or a value that does not parse as the
    /// declared kind.
    pub fn resolve<F>(
        descriptors: &[FlagDescriptor],
        user: &BTreeMap<String, Vec<String>>,
        env: F,
    ) -> Result<Self, DriverError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(unknown) = user
            .keys()
            .find(|name| !descriptors.iter().any(|flag| flag.name() == name.as_str()))
        {
            return Err(DriverError::config(format!("unknown driver flag --{unknown}")));
        }

        let mut options = Self::new();
        for descriptor in descriptors {
            let value = if let Some(raw) = user.get(descriptor.name()) {
                descriptor.parse(raw)?
            } else if let Some(text) = descriptor.env_var().and_then(&env) {
                descriptor.parse_env(&text)?
            } else {
                descriptor.default_value()
            };
            options.insert(descriptor.name(), value);
        }
        Ok(options)
    }
}

/// Groups raw command-line driver flags by name.
///
/// Accepts `--name value`, `--name=value` and bare `--name` (a boolean
/// switch). Repeating a flag collects every value in order.
///
/// # Errors
///
/// Returns [`DriverError::ConfigInvalid`] for a token that is not a flag
/// where a flag name is expected.
pub fn group_flag_args(args: &[String]) -> Result<BTreeMap<String, Vec<String>>, DriverError> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut tokens = args.iter().peekable();
    while let Some(token) = tokens.next() {
        let Some(flag) = token.strip_prefix("--").filter(|rest| !rest.is_empty()) else {
            return Err(DriverError::config(format!(
                "unexpected argument '{token}'; driver flags look like --name value"
            )));
        };
        if let Some((name, value)) = flag.split_once('=') {
            grouped.entry(name.to_owned()).or_default().push(value.to_owned());
            continue;
        }
        let values = grouped.entry(flag.to_owned()).or_default();
        if let Some(value) = tokens.next_if(|next| !next.starts_with("--")) {
            values.push(value.clone());
        }
    }
    Ok(grouped)
}
