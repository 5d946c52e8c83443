use crate::image::{self, ParseError, Reference};
use crate::models::TriggerType;
use crate::policy::{Policy, PolicyError, PolicyOptions};
use crate::trigger::poll::DEFAULT_POLL_SCHEDULE;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

/// Key of the chart values holding the update configuration.
pub const CONFIG_KEY: &str = "bowline";

#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("value path is empty")]
    EmptyPath,

    #[error("value '{0}' not found")]
    NotFound(String),

    #[error("value '{0}' is not a scalar")]
    NotScalar(String),

    #[error("image at '{path}' is invalid: {source}")]
    Image {
        path: String,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Error)]
pub enum ChartConfigError {
    #[error("chart values have no 'bowline' block")]
    NotFound,

    #[error("policy not specified")]
    PolicyNotSpecified,

    #[error("invalid 'bowline' block: {0}")]
    Invalid(#[from] serde_yaml::Error),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Where one image lives inside the chart values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    /// Path of the repository value, or of the full image when `tag` is empty
    pub repository: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub image_pull_secret: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChartConfig {
    #[serde(default)]
    policy: String,
    #[serde(default)]
    trigger: Option<String>,
    #[serde(default)]
    poll_schedule: Option<String>,
    #[serde(default)]
    match_tag: bool,
    #[serde(default)]
    approvals: u32,
    #[serde(default)]
    approval_deadline: i64,
    #[serde(default)]
    notification_channels: Vec<String>,
    #[serde(default)]
    images: Vec<ImageDetails>,
}

#[derive(Debug, Clone)]
pub struct ChartConfig {
    pub policy: Policy,
    pub trigger: TriggerType,
    pub poll_schedule: String,
    pub approvals: u32,
    pub approval_deadline: i64,
    pub notification_channels: Vec<String>,
    pub images: Vec<ImageDetails>,
}

impl ChartConfig {
    pub fn from_values(values: &Value) -> Result<Self, ChartConfigError> {
        let block = values.get(CONFIG_KEY).ok_or(ChartConfigError::NotFound)?;
        let raw: RawChartConfig = serde_yaml::from_value(block.clone())?;

        if raw.policy.trim().is_empty() {
            return Err(ChartConfigError::PolicyNotSpecified);
        }

        let policy = Policy::from_name(
            &raw.policy,
            PolicyOptions {
                match_tag: raw.match_tag,
            },
        )?;

        let trigger = raw
            .trigger
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();

        Ok(Self {
            policy,
            trigger,
            poll_schedule: raw
                .poll_schedule
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_POLL_SCHEDULE.to_string()),
            approvals: raw.approvals,
            approval_deadline: raw.approval_deadline,
            notification_channels: raw.notification_channels,
            images: raw.images,
        })
    }
}

/// Resolves a dotted path through nested mappings and stringifies the scalar
/// found there.
pub fn get_value_as_string(values: &Value, path: &str) -> Result<String, ValuesError> {
    if path.trim().is_empty() {
        return Err(ValuesError::EmptyPath);
    }

    let mut current = values;
    for segment in path.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| ValuesError::NotFound(path.to_string()))?;
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Tagged(tagged) => match &tagged.value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(ValuesError::NotScalar(path.to_string())),
        },
        _ => Err(ValuesError::NotScalar(path.to_string())),
    }
}

/// Reads the image `details` points at. A missing tag value falls back to
/// whatever the repository value spells.
pub fn parse_image(values: &Value, details: &ImageDetails) -> Result<Reference, ValuesError> {
    let name = get_value_as_string(values, &details.repository)?;

    let raw = match get_value_as_string(values, &details.tag) {
        Ok(tag) => format!("{}:{}", name, tag),
        Err(_) => name,
    };

    image::parse(&raw).map_err(|source| ValuesError::Image {
        path: details.repository.clone(),
        source,
    })
}

/// Value path and value that move `image` to `tag`.
pub fn plan_values(image: &Reference, details: &ImageDetails, tag: &str) -> (String, String) {
    if details.tag.is_empty() {
        (details.repository.clone(), image.with_tag(tag))
    } else {
        (details.tag.clone(), tag.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUES: &str = r#"
name: al Rashid
where:
  city: Basrah
  title: caliph
image:
  repository: gcr.io/v2-namespace/hello-world
  tag: 1.1.0
port: 8080
enabled: true
bowline:
  policy: all
  trigger: poll
  approvals: 2
  images:
    - repository: image.repository
      tag: image.tag
"#;

    fn values() -> Value {
        serde_yaml::from_str(VALUES).unwrap()
    }

    #[test]
    fn test_get_value_as_string() {
        let values = values();
        assert_eq!(get_value_as_string(&values, "name").unwrap(), "al Rashid");
        assert_eq!(get_value_as_string(&values, "where.city").unwrap(), "Basrah");
        assert_eq!(get_value_as_string(&values, "port").unwrap(), "8080");
        assert_eq!(get_value_as_string(&values, "enabled").unwrap(), "true");
        assert!(matches!(
            get_value_as_string(&values, "where.country"),
            Err(ValuesError::NotFound(_))
        ));
        assert!(matches!(
            get_value_as_string(&values, "where"),
            Err(ValuesError::NotScalar(_))
        ));
        assert!(matches!(
            get_value_as_string(&values, ""),
            Err(ValuesError::EmptyPath)
        ));
    }

    #[test]
    fn test_chart_config() {
        let config = ChartConfig::from_values(&values()).unwrap();
        assert_eq!(config.policy.name(), "all");
        assert_eq!(config.trigger, TriggerType::Poll);
        assert_eq!(config.poll_schedule, DEFAULT_POLL_SCHEDULE);
        assert_eq!(config.approvals, 2);
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.images[0].tag, "image.tag");
    }

    #[test]
    fn test_chart_config_missing() {
        let values: Value = serde_yaml::from_str("image:\n  tag: 1.0.0\n").unwrap();
        assert!(matches!(
            ChartConfig::from_values(&values),
            Err(ChartConfigError::NotFound)
        ));

        let values: Value = serde_yaml::from_str("bowline:\n  trigger: poll\n").unwrap();
        assert!(matches!(
            ChartConfig::from_values(&values),
            Err(ChartConfigError::PolicyNotSpecified)
        ));
    }

    #[test]
    fn test_chart_config_bad_glob() {
        let values: Value = serde_yaml::from_str("bowline:\n  policy: \"glob:[abc\"\n").unwrap();
        assert!(matches!(
            ChartConfig::from_values(&values),
            Err(ChartConfigError::Policy(_))
        ));
    }

    #[test]
    fn test_parse_image() {
        let values = values();
        let details = ImageDetails {
            repository: "image.repository".to_string(),
            tag: "image.tag".to_string(),
            ..Default::default()
        };
        let image = parse_image(&values, &details).unwrap();
        assert_eq!(image.remote(), "gcr.io/v2-namespace/hello-world:1.1.0");

        let untagged = ImageDetails {
            repository: "image.repository".to_string(),
            tag: "image.missing".to_string(),
            ..Default::default()
        };
        assert_eq!(parse_image(&values, &untagged).unwrap().tag(), "latest");
    }

    #[test]
    fn test_plan_values() {
        let hub = image::parse("karolisr/keel:0.1.0").unwrap();
        let gcr = image::parse("gcr.io/v2-namespace/hello-world:1.1.0").unwrap();
        let full = ImageDetails {
            repository: "image".to_string(),
            ..Default::default()
        };
        let split = ImageDetails {
            repository: "image.repository".to_string(),
            tag: "image.tag".to_string(),
            ..Default::default()
        };

        assert_eq!(
            plan_values(&hub, &full, "0.2.0"),
            ("image".to_string(), "karolisr/keel:0.2.0".to_string())
        );
        assert_eq!(
            plan_values(&gcr, &full, "1.2.0"),
            ("image".to_string(), "gcr.io/v2-namespace/hello-world:1.2.0".to_string())
        );
        assert_eq!(
            plan_values(&gcr, &split, "1.2.0"),
            ("image.tag".to_string(), "1.2.0".to_string())
        );
    }
}
