//! Binding configuration: raw consumer policy and its resolved, immutable form

use crate::consumer::converter::{
    ConverterRegistry, MessageConverter, StandardHeaders, TrustedTypes, DEFAULT_CONVERTER,
};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::retry::RetryPolicy;
use rdkafka::ClientConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Upper bound on handler invocations per record, applied when `maxAttempts` is unset
pub const MAX_ATTEMPTS_CEILING: u32 = 1000;
/// Maximum recovery interval to prevent a worker from stalling for hours
const MAX_RECOVERY_INTERVAL_SECONDS: u64 = 3600;

/// Millisecond (de)serialisation for durations, bounded on the way in
mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        let duration = Duration::from_millis(millis);
        if duration.as_secs() > MAX_RECOVERY_INTERVAL_SECONDS {
            return Err(serde::de::Error::custom(format!(
                "duration {:?} exceeds maximum allowed {} seconds",
                duration, MAX_RECOVERY_INTERVAL_SECONDS
            )));
        }
        Ok(duration)
    }
}

/// Initial position for partitions that have no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartOffset {
    /// Oldest retained record
    Earliest,
    /// Next record produced after assignment
    Latest,
}

impl StartOffset {
    /// Broker reference point for `earliest`
    pub const EARLIEST_REFERENCE: i64 = -2;
    /// Broker reference point for `latest`
    pub const LATEST_REFERENCE: i64 = -1;

    /// Numeric reference point understood by the broker
    pub const fn reference_point(self) -> i64 {
        match self {
            StartOffset::Earliest => Self::EARLIEST_REFERENCE,
            StartOffset::Latest => Self::LATEST_REFERENCE,
        }
    }

    /// Value for the client's `auto.offset.reset` setting
    pub const fn as_reset_policy(self) -> &'static str {
        match self {
            StartOffset::Earliest => "earliest",
            StartOffset::Latest => "latest",
        }
    }
}

/// What to do once a record ends `Fatal`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FatalAction {
    /// Stop the binding: no further dispatch, graceful shutdown
    Stop,
    /// Record the event, leave the offset uncommitted and move on
    Skip,
}

/// Shape of the value written to the dead-letter topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DlqValueFormat {
    /// Original payload bytes; failure details travel in headers only
    #[default]
    Raw,
    /// JSON document wrapping failure metadata and the original payload
    JsonEnvelope,
}

/// Partition selection for dead-letter records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DlqPartitioning {
    /// Let the producer partitioner decide (key hash)
    #[default]
    Default,
    /// Same partition number as the failed record
    SourcePartition,
    /// Always this partition
    Fixed(i32),
}

/// Producer settings used only for dead-letter publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DlqProducerPolicy {
    /// Value encoding
    pub value_format: DlqValueFormat,
    /// Partition selection; `fixed` is written as a single-key map
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub partitioning: DlqPartitioning,
    /// Partitions to create when the DLQ topic is missing
    pub partition_count: Option<i32>,
    /// Replication factor to create the DLQ topic with
    pub replication_factor: Option<i32>,
    /// Bound on a single publish, including broker acknowledgement
    #[serde(with = "millis")]
    pub send_timeout: Duration,
    /// Raw producer settings, lowest precedence
    pub configuration: BTreeMap<String, String>,
}

impl Default for DlqProducerPolicy {
    fn default() -> Self {
        Self {
            value_format: DlqValueFormat::Raw,
            partitioning: DlqPartitioning::Default,
            partition_count: None,
            replication_factor: None,
            send_timeout: Duration::from_secs(30),
            configuration: BTreeMap::new(),
        }
    }
}

/// Consumer policy for one logical input binding, as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingConsumerPolicy {
    /// Group-managed assignment (true) or pinned partitions (false)
    pub auto_rebalance_enabled: bool,
    /// Commit automatically after handling
    pub auto_commit_offset: bool,
    /// Commit records routed to the DLQ; unset behaves as true
    pub auto_commit_on_error: Option<bool>,
    /// Ignore committed offsets on first assignment and seek to `start_offset`
    pub reset_offsets: bool,
    /// Seek target for partitions without a committed offset
    pub start_offset: Option<StartOffset>,
    /// Route exhausted records to a dead-letter topic
    pub enable_dlq: bool,
    /// Explicit DLQ topic; derived from group and destination when unset
    pub dlq_name: Option<String>,
    /// Producer profile for DLQ publishing
    pub dlq_producer_policy: DlqProducerPolicy,
    /// Fixed backoff between attempts
    #[serde(with = "millis")]
    pub recovery_interval: Duration,
    /// Total attempts per record; unset means up to [`MAX_ATTEMPTS_CEILING`]
    pub max_attempts: Option<u32>,
    /// Type name patterns trusted during payload decoding
    pub trusted_packages: Vec<String>,
    /// Metadata headers to attach to inbound records
    pub standard_headers: StandardHeaders,
    /// Named converter override
    pub converter_bean_name: Option<String>,
    /// Escalation for `Fatal` outcomes; must be set explicitly
    pub on_fatal: Option<FatalAction>,
    /// This instance's index when partitions are pinned
    pub instance_index: u32,
    /// Number of instances sharing the destination when partitions are pinned
    pub instance_count: u32,
    /// Queue depth at which a partition is paused
    pub pause_threshold: usize,
    /// Queue depth at which a paused partition resumes
    pub resume_threshold: usize,
    /// How long a revocation waits for in-flight records
    #[serde(with = "millis")]
    pub revocation_drain_timeout: Duration,
    /// How long shutdown waits for in-flight records
    #[serde(with = "millis")]
    pub shutdown_grace_period: Duration,
    /// Interval of the periodic metrics log line
    #[serde(with = "millis")]
    pub metrics_interval: Duration,
    /// Raw client settings, lowest precedence
    pub configuration: BTreeMap<String, String>,
}

impl Default for BindingConsumerPolicy {
    fn default() -> Self {
        Self {
            auto_rebalance_enabled: true,
            auto_commit_offset: true,
            auto_commit_on_error: None,
            reset_offsets: false,
            start_offset: None,
            enable_dlq: false,
            dlq_name: None,
            dlq_producer_policy: DlqProducerPolicy::default(),
            recovery_interval: Duration::from_millis(5000),
            max_attempts: None,
            trusted_packages: Vec::new(),
            standard_headers: StandardHeaders::None,
            converter_bean_name: None,
            on_fatal: None,
            instance_index: 0,
            instance_count: 1,
            pause_threshold: 1000,
            resume_threshold: 100,
            revocation_drain_timeout: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            configuration: BTreeMap::new(),
        }
    }
}

impl BindingConsumerPolicy {
    /// Create a new policy builder
    pub fn builder() -> BindingConsumerPolicyBuilder {
        BindingConsumerPolicyBuilder::new()
    }
}

/// Builder for BindingConsumerPolicy
#[derive(Debug, Default)]
pub struct BindingConsumerPolicyBuilder {
    policy: BindingConsumerPolicy,
}

impl BindingConsumerPolicyBuilder {
    /// Create a new builder holding the defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_rebalance_enabled(mut self, enabled: bool) -> Self {
        self.policy.auto_rebalance_enabled = enabled;
        self
    }

    pub fn auto_commit_offset(mut self, enabled: bool) -> Self {
        self.policy.auto_commit_offset = enabled;
        self
    }

    pub fn auto_commit_on_error(mut self, enabled: bool) -> Self {
        self.policy.auto_commit_on_error = Some(enabled);
        self
    }

    pub fn reset_offsets(mut self, reset: bool) -> Self {
        self.policy.reset_offsets = reset;
        self
    }

    pub fn start_offset(mut self, start: StartOffset) -> Self {
        self.policy.start_offset = Some(start);
        self
    }

    pub fn enable_dlq(mut self, enabled: bool) -> Self {
        self.policy.enable_dlq = enabled;
        self
    }

    /// Set an explicit dead letter topic
    pub fn dlq_name(mut self, name: impl Into<String>) -> Self {
        self.policy.dlq_name = Some(name.into());
        self
    }

    pub fn dlq_producer_policy(mut self, policy: DlqProducerPolicy) -> Self {
        self.policy.dlq_producer_policy = policy;
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.policy.recovery_interval = interval;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = Some(attempts);
        self
    }

    /// Trust an additional payload type pattern
    pub fn trusted_package(mut self, pattern: impl Into<String>) -> Self {
        self.policy.trusted_packages.push(pattern.into());
        self
    }

    pub fn standard_headers(mut self, headers: StandardHeaders) -> Self {
        self.policy.standard_headers = headers;
        self
    }

    pub fn converter_bean_name(mut self, name: impl Into<String>) -> Self {
        self.policy.converter_bean_name = Some(name.into());
        self
    }

    pub fn on_fatal(mut self, action: FatalAction) -> Self {
        self.policy.on_fatal = Some(action);
        self
    }

    /// Pin partitions to this instance
    pub fn instance(mut self, index: u32, count: u32) -> Self {
        self.policy.instance_index = index;
        self.policy.instance_count = count;
        self
    }

    pub fn revocation_drain_timeout(mut self, timeout: Duration) -> Self {
        self.policy.revocation_drain_timeout = timeout;
        self
    }

    pub fn shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.policy.shutdown_grace_period = grace;
        self
    }

    /// Add a raw client property
    pub fn configuration(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.policy.configuration.insert(key.into(), value.into());
        self
    }

    /// Build the policy
    pub fn build(self) -> BindingConsumerPolicy {
        self.policy
    }
}

/// Client keys always driven by typed fields
const RESERVED_CLIENT_KEYS: &[&str] = &[
    "bootstrap.servers",
    "group.id",
    "enable.auto.commit",
    "enable.auto.offset.store",
];

/// Validated, immutable configuration of one input binding
#[derive(Clone)]
pub struct BindingConfig {
    binding: String,
    destination: String,
    group: String,
    policy: BindingConsumerPolicy,
    dlq_destination: String,
    retry_policy: RetryPolicy,
    fatal_action: FatalAction,
    converter: Arc<dyn MessageConverter>,
    trusted_types: TrustedTypes,
}

impl fmt::Debug for BindingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingConfig")
            .field("binding", &self.binding)
            .field("destination", &self.destination)
            .field("group", &self.group)
            .field("dlq_destination", &self.dlq_destination)
            .field("converter", &self.converter.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl BindingConfig {
    /// Validate a policy and freeze it for one binding
    pub fn resolve(
        binding: impl Into<String>,
        destination: impl Into<String>,
        group: impl Into<String>,
        policy: BindingConsumerPolicy,
        converters: &ConverterRegistry,
    ) -> ConsumerResult<Self> {
        let binding = binding.into();
        let destination = destination.into();
        let group = group.into();
        let invalid = |msg: String| ConsumerError::ConfigError(format!("binding '{}': {}", binding, msg));

        if destination.trim().is_empty() {
            return Err(invalid("destination cannot be empty".to_string()));
        }
        if group.trim().is_empty() {
            return Err(invalid("group cannot be empty".to_string()));
        }
        if matches!(&policy.dlq_name, Some(name) if name.trim().is_empty()) {
            return Err(invalid("dlqName cannot be empty when set".to_string()));
        }

        let max_attempts = match policy.max_attempts {
            Some(0) => return Err(invalid("maxAttempts must be at least 1".to_string())),
            Some(n) if n > MAX_ATTEMPTS_CEILING => {
                return Err(invalid(format!(
                    "maxAttempts {} exceeds maximum allowed value {}",
                    n, MAX_ATTEMPTS_CEILING
                )))
            }
            Some(n) => n,
            None => MAX_ATTEMPTS_CEILING,
        };

        if policy.recovery_interval.as_secs() > MAX_RECOVERY_INTERVAL_SECONDS {
            return Err(invalid(format!(
                "recoveryInterval {:?} exceeds maximum allowed {} seconds",
                policy.recovery_interval, MAX_RECOVERY_INTERVAL_SECONDS
            )));
        }

        if policy.metrics_interval.is_zero() {
            return Err(invalid("metricsInterval must be positive".to_string()));
        }

        if policy.reset_offsets && policy.start_offset.is_none() {
            return Err(invalid("resetOffsets requires startOffset".to_string()));
        }

        if !policy.auto_rebalance_enabled
            && (policy.instance_count == 0 || policy.instance_index >= policy.instance_count)
        {
            return Err(invalid(format!(
                "instanceIndex {} must be below instanceCount {}",
                policy.instance_index, policy.instance_count
            )));
        }

        if policy.pause_threshold == 0 || policy.resume_threshold >= policy.pause_threshold {
            return Err(invalid(
                "pauseThreshold must be greater than resumeThreshold".to_string(),
            ));
        }

        if let DlqPartitioning::Fixed(p) = policy.dlq_producer_policy.partitioning {
            if p < 0 {
                return Err(invalid(format!("fixed DLQ partition {} is negative", p)));
            }
        }

        let fatal_action = policy.on_fatal.ok_or_else(|| {
            invalid("onFatal must be set explicitly (stop or skip)".to_string())
        })?;

        let converter_name = policy
            .converter_bean_name
            .as_deref()
            .unwrap_or(DEFAULT_CONVERTER);
        let converter = converters
            .get(converter_name)
            .ok_or_else(|| invalid(format!("unknown converter '{}'", converter_name)))?;

        let trusted_types = TrustedTypes::new(&policy.trusted_packages)
            .map_err(|e| invalid(format!("invalid trustedPackages pattern: {}", e)))?;

        let dlq_destination = policy
            .dlq_name
            .clone()
            .unwrap_or_else(|| derive_dlq_name(&group, &destination));

        let retry_policy = RetryPolicy::fixed(max_attempts, policy.recovery_interval);

        Ok(Self {
            binding,
            destination,
            group,
            policy,
            dlq_destination,
            retry_policy,
            fatal_action,
            converter,
            trusted_types,
        })
    }

    /// Logical binding name
    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Source topic
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Consumer group
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The policy this configuration was resolved from
    pub fn policy(&self) -> &BindingConsumerPolicy {
        &self.policy
    }

    /// Resolved dead-letter topic (explicit or derived)
    pub fn dlq_destination(&self) -> &str {
        &self.dlq_destination
    }

    /// Whether exhausted records go to the DLQ
    pub fn dlq_enabled(&self) -> bool {
        self.policy.enable_dlq
    }

    /// Retry policy derived from `maxAttempts` and `recoveryInterval`
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Escalation for fatal outcomes
    pub fn fatal_action(&self) -> FatalAction {
        self.fatal_action
    }

    /// Converter used to decode inbound payloads
    pub fn converter(&self) -> &Arc<dyn MessageConverter> {
        &self.converter
    }

    /// Trusted payload types
    pub fn trusted_types(&self) -> &TrustedTypes {
        &self.trusted_types
    }

    /// Whether a record routed to the DLQ still advances the committed offset
    pub fn commit_on_dlq(&self) -> bool {
        self.policy.auto_commit_on_error.unwrap_or(true)
    }

    /// Consumer client settings: passthrough first, typed fields on top
    pub fn consumer_client_config(&self, brokers: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        for (key, value) in &self.policy.configuration {
            let typed = RESERVED_CLIENT_KEYS.contains(&key.as_str())
                || (key == "auto.offset.reset" && self.policy.start_offset.is_some());
            if typed {
                warn!(
                    binding = %self.binding,
                    key = %key,
                    "Ignoring passthrough property owned by a typed binding field"
                );
                continue;
            }
            client_config.set(key, value);
        }

        client_config
            .set("bootstrap.servers", brokers)
            .set("group.id", &self.group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if let Some(start) = self.policy.start_offset {
            client_config.set("auto.offset.reset", start.as_reset_policy());
        }

        client_config
    }

    /// DLQ producer settings, independent of the consumer's
    pub fn dlq_client_config(&self, brokers: &str) -> ClientConfig {
        let producer = &self.policy.dlq_producer_policy;
        let mut client_config = ClientConfig::new();
        for (key, value) in &producer.configuration {
            if key == "bootstrap.servers" {
                continue;
            }
            client_config.set(key, value);
        }
        client_config
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", producer.send_timeout.as_millis().to_string());
        client_config
    }
}

/// Default dead-letter topic name: `<group>.<destination>.dlq`
pub fn derive_dlq_name(group: &str, destination: &str) -> String {
    format!("{}.{}.dlq", group, destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolve(policy: BindingConsumerPolicy) -> ConsumerResult<BindingConfig> {
        BindingConfig::resolve("input", "orders", "g1", policy, &ConverterRegistry::with_defaults())
    }

    fn skip_policy() -> BindingConsumerPolicyBuilder {
        BindingConsumerPolicy::builder().on_fatal(FatalAction::Skip)
    }

    #[test]
    fn test_defaults() {
        let policy = BindingConsumerPolicy::default();
        assert!(policy.auto_rebalance_enabled);
        assert!(policy.auto_commit_offset);
        assert_eq!(policy.auto_commit_on_error, None);
        assert_eq!(policy.start_offset, None);
        assert!(!policy.enable_dlq);
        assert_eq!(policy.recovery_interval, Duration::from_millis(5000));
        assert_eq!(policy.standard_headers, StandardHeaders::None);
        assert_eq!(policy.dlq_producer_policy, DlqProducerPolicy::default());
    }

    #[test]
    fn test_reference_points() {
        assert_eq!(StartOffset::Earliest.reference_point(), -2);
        assert_eq!(StartOffset::Latest.reference_point(), -1);
    }

    #[test]
    fn test_derived_dlq_name() {
        let config = resolve(skip_policy().enable_dlq(true).recovery_interval(Duration::ZERO).build()).unwrap();
        assert_eq!(config.dlq_destination(), "g1.orders.dlq");

        let explicit = resolve(skip_policy().dlq_name("errors").build()).unwrap();
        assert_eq!(explicit.dlq_destination(), "errors");
    }

    #[test]
    fn test_unset_max_attempts_uses_ceiling() {
        let config = resolve(skip_policy().build()).unwrap();
        assert_eq!(config.retry_policy().max_attempts, MAX_ATTEMPTS_CEILING);
    }

    #[test]
    fn test_validation_failures() {
        assert!(resolve(BindingConsumerPolicy::default()).is_err(), "onFatal is required");
        assert!(resolve(skip_policy().max_attempts(0).build()).is_err());
        assert!(resolve(skip_policy().max_attempts(MAX_ATTEMPTS_CEILING + 1).build()).is_err());
        assert!(resolve(skip_policy().reset_offsets(true).build()).is_err());
        assert!(resolve(skip_policy().dlq_name("  ").build()).is_err());
        assert!(resolve(skip_policy().converter_bean_name("avro").build()).is_err());
        assert!(resolve(skip_policy().trusted_package("a[").build()).is_err());
        assert!(resolve(
            skip_policy()
                .auto_rebalance_enabled(false)
                .instance(2, 2)
                .build()
        )
        .is_err());
        assert!(resolve(skip_policy().recovery_interval(Duration::from_secs(7200)).build()).is_err());

        let mut silent = skip_policy().build();
        silent.metrics_interval = Duration::ZERO;
        assert!(resolve(silent).is_err());

        let err = BindingConfig::resolve(
            "input",
            "",
            "g1",
            skip_policy().build(),
            &ConverterRegistry::with_defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, ConsumerError::ConfigError(_)));
    }

    #[test]
    fn test_typed_fields_win_over_passthrough() {
        let config = resolve(
            skip_policy()
                .start_offset(StartOffset::Earliest)
                .configuration("group.id", "hijacked")
                .configuration("auto.offset.reset", "latest")
                .configuration("enable.auto.commit", "true")
                .configuration("fetch.min.bytes", "1024")
                .build(),
        )
        .unwrap();

        let client = config.consumer_client_config("broker:9092");
        assert_eq!(client.get("group.id"), Some("g1"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("fetch.min.bytes"), Some("1024"));
        assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
    }

    #[test]
    fn test_passthrough_offset_reset_applies_without_start_offset() {
        let config = resolve(skip_policy().configuration("auto.offset.reset", "earliest").build()).unwrap();
        let client = config.consumer_client_config("broker:9092");
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_commit_on_dlq_defaults_to_true() {
        assert!(resolve(skip_policy().build()).unwrap().commit_on_dlq());
        assert!(!resolve(skip_policy().auto_commit_on_error(false).build())
            .unwrap()
            .commit_on_dlq());
    }

    #[test]
    fn test_deserialize_camel_case_yaml() {
        let yaml = r#"
autoCommitOnError: false
startOffset: earliest
enableDlq: true
recoveryInterval: 250
maxAttempts: 4
standardHeaders: both
onFatal: stop
trustedPackages: ["acme.*"]
dlqProducerPolicy:
  valueFormat: jsonEnvelope
  partitioning:
    fixed: 2
  sendTimeout: 1000
configuration:
  fetch.min.bytes: "1"
"#;
        let policy: BindingConsumerPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.auto_commit_on_error, Some(false));
        assert_eq!(policy.start_offset, Some(StartOffset::Earliest));
        assert_eq!(policy.recovery_interval, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, Some(4));
        assert_eq!(policy.standard_headers, StandardHeaders::Both);
        assert_eq!(policy.on_fatal, Some(FatalAction::Stop));
        assert_eq!(policy.dlq_producer_policy.value_format, DlqValueFormat::JsonEnvelope);
        assert_eq!(policy.dlq_producer_policy.partitioning, DlqPartitioning::Fixed(2));
        assert_eq!(policy.dlq_producer_policy.send_timeout, Duration::from_secs(1));
        assert!(policy.auto_commit_offset, "unset fields keep defaults");
    }

    #[test]
    fn test_dlq_partitioning_yaml_forms() {
        let parse = |yaml: &str| serde_yaml::from_str::<DlqProducerPolicy>(yaml).unwrap().partitioning;

        assert_eq!(parse("partitioning:\n  fixed: 2\n"), DlqPartitioning::Fixed(2));
        assert_eq!(parse("partitioning: {fixed: 5}\n"), DlqPartitioning::Fixed(5));
        assert_eq!(parse("partitioning: sourcePartition\n"), DlqPartitioning::SourcePartition);
        assert_eq!(parse("sendTimeout: 10\n"), DlqPartitioning::Default);

        let written = serde_yaml::to_string(&DlqProducerPolicy {
            partitioning: DlqPartitioning::Fixed(3),
            ..Default::default()
        })
        .unwrap();
        assert!(written.contains("fixed: 3"), "{}", written);
    }
}
