//! Turns stored integration records into the per-submission delivery list.
//!
//! Resolution never fails: a field with an unexpected shape is treated as
//! absent, and the handler for that channel rejects the job if the field
//! was required.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{
    ApiEmailConfig, DiscordConfig, FormId, IntegrationConfig, IntegrationRecord, IntegrationScope,
    IntegrationType, OauthEmailConfig, OrganizationId, SlackConfig, SmtpEmailConfig,
    TelegramConfig, TemplatePairs, WebhookConfig, WhatsappConfig,
};

/// One integration that fires for a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIntegration {
    pub id: Option<i64>,
    pub name: String,
    pub scope: IntegrationScope,
    pub config: IntegrationConfig,
}

impl ResolvedIntegration {
    pub fn kind(&self) -> IntegrationType {
        self.config.kind()
    }

    /// Stable label used in singleton keys.
    ///
    /// Records without an id are told apart by a digest of their config, so
    /// two unsaved webhooks with different targets never share a key.
    pub(crate) fn key(&self) -> String {
        match self.id {
            Some(id) => format!("{}#{id}", self.kind()),
            None => {
                let config = serde_json::to_vec(&self.config).unwrap_or_default();
                let digest = hex::encode(Sha256::digest(&config));
                format!("{}:{}:{}", self.kind(), self.name, &digest[..12])
            }
        }
    }
}

/// Integrations to deliver for one submission, org-level entries first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveIntegrationSet {
    pub integrations: Vec<ResolvedIntegration>,
}

impl EffectiveIntegrationSet {
    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedIntegration> {
        self.integrations.iter()
    }

    pub fn kinds(&self) -> Vec<IntegrationType> {
        self.integrations.iter().map(|i| i.kind()).collect()
    }
}

/// Merge organization and form records into the effective set.
///
/// Inactive records are dropped. With inheritance on, an organization
/// record is skipped when the form has an active record of the same type.
pub fn resolve(
    org_integrations: &[IntegrationRecord],
    form_integrations: &[IntegrationRecord],
    use_org_integrations: bool,
) -> EffectiveIntegrationSet {
    let form_active: Vec<&IntegrationRecord> =
        form_integrations.iter().filter(|r| r.is_active).collect();

    let mut integrations = Vec::new();

    if use_org_integrations {
        let shadowed: HashSet<IntegrationType> = form_active.iter().map(|r| r.kind).collect();
        integrations.extend(
            org_integrations
                .iter()
                .filter(|r| r.is_active && !shadowed.contains(&r.kind))
                .map(resolve_record),
        );
    }

    integrations.extend(form_active.into_iter().map(resolve_record));

    EffectiveIntegrationSet { integrations }
}

fn resolve_record(record: &IntegrationRecord) -> ResolvedIntegration {
    ResolvedIntegration {
        id: record.id,
        name: record.name.clone(),
        scope: record.scope,
        config: parse_config(record.kind, &record.config),
    }
}

/// Copy of `record` whose email recipients are normalized in place.
pub fn normalize_record(record: &IntegrationRecord) -> IntegrationRecord {
    let mut record = record.clone();
    if record.kind.is_email() {
        let recipients = normalize_recipients(record.config.get("recipients"));
        if !record.config.is_object() {
            record.config = Value::Object(Map::new());
        }
        if let Some(bag) = record.config.as_object_mut() {
            bag.insert(
                "recipients".to_string(),
                Value::Array(recipients.into_iter().map(Value::String).collect()),
            );
        }
    }
    record
}

/// Recipients as an ordered list of trimmed, non-empty addresses.
///
/// Accepts a comma-separated string or an array of strings.
pub fn normalize_recipients(raw: Option<&Value>) -> Vec<String> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    };

    match raw {
        Some(Value::String(s)) => split(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(split)
            .collect(),
        _ => Vec::new(),
    }
}

/// Typed channel config from an untyped bag.
pub fn parse_config(kind: IntegrationType, bag: &Value) -> IntegrationConfig {
    let recipients = || normalize_recipients(field(bag, &["recipients", "to"]));

    match kind {
        IntegrationType::Webhook => IntegrationConfig::Webhook(WebhookConfig {
            url: text(bag, &["url", "webhookUrl"]),
            method: text(bag, &["method"]),
            headers: pairs(field(bag, &["headers"])),
            query_params: pairs(field(bag, &["queryParams", "query"])),
            body_params: pairs(field(bag, &["bodyParams", "body"])),
            cookies: pairs(field(bag, &["cookies"])),
            secret: text(bag, &["secret", "signingSecret"]),
        }),
        IntegrationType::EmailSmtp => IntegrationConfig::EmailSmtp(SmtpEmailConfig {
            recipients: recipients(),
            host: text(bag, &["host", "smtpHost"]),
            port: port(bag),
            secure: flag(bag, &["secure"]),
            username: text(bag, &["user", "username", "smtpUser"]),
            password: text(bag, &["pass", "password", "smtpPass"]),
            from: text(bag, &["from"]),
        }),
        IntegrationType::EmailOauth => IntegrationConfig::EmailOauth(OauthEmailConfig {
            recipients: recipients(),
            user: text(bag, &["user", "email"]),
            client_id: text(bag, &["clientId"]),
            client_secret: text(bag, &["clientSecret"]),
            access_token: text(bag, &["accessToken"]),
            refresh_token: text(bag, &["refreshToken"]),
            host: text(bag, &["host", "smtpHost"]),
            port: port(bag),
            from: text(bag, &["from"]),
        }),
        IntegrationType::EmailApi => IntegrationConfig::EmailApi(ApiEmailConfig {
            recipients: recipients(),
            provider: text(bag, &["provider"]).map(|p| p.to_lowercase()),
            api_token: text(bag, &["apiKey", "token", "apiToken"]),
            from: text(bag, &["from"]),
        }),
        IntegrationType::Telegram => IntegrationConfig::Telegram(TelegramConfig {
            chat_id: text(bag, &["chatId"]),
        }),
        IntegrationType::Discord => IntegrationConfig::Discord(DiscordConfig {
            webhook_url: text(bag, &["webhookUrl", "url"]),
        }),
        IntegrationType::Slack => IntegrationConfig::Slack(SlackConfig {
            channel_id: text(bag, &["channelId"]),
            access_token: text(bag, &["accessToken"]),
        }),
        IntegrationType::Whatsapp => IntegrationConfig::Whatsapp(WhatsappConfig {
            phone_number_id: text(bag, &["phoneNumberId"]),
            access_token: text(bag, &["accessToken"]),
            recipient: text(bag, &["recipient", "to", "phoneNumber"]),
        }),
    }
}

fn field<'a>(bag: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| bag.get(*key))
        .find(|value| !value.is_null())
}

/// Non-empty trimmed text; numbers are accepted in their decimal form.
fn text(bag: &Value, keys: &[&str]) -> Option<String> {
    field(bag, keys).and_then(value_text)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag(bag: &Value, keys: &[&str]) -> Option<bool> {
    match field(bag, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn port(bag: &Value) -> Option<u16> {
    match field(bag, &["port", "smtpPort"])? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Key/value pairs from `{k: v}` or `[{key, value}]` / `[[k, v]]`.
fn pairs(raw: Option<&Value>) -> TemplatePairs {
    let scalar = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) => Some(v.to_string()),
        _ => None,
    };

    match raw {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), scalar(v)?)))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(entry) => {
                    let key = entry.get("key").and_then(Value::as_str)?;
                    let value = entry.get("value").map(scalar).unwrap_or_default()?;
                    Some((key.to_string(), value))
                }
                Value::Array(pair) if pair.len() == 2 => {
                    Some((pair[0].as_str()?.to_string(), scalar(&pair[1])?))
                }
                _ => None,
            })
            .filter(|(key, _)| !key.trim().is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Combined single-row configuration used before integrations became
/// separate records: one enabled flag plus fields per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIntegrationConfig {
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub form_id: Option<FormId>,

    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub email_recipients: Option<Value>,

    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub telegram_enabled: bool,
    #[serde(default)]
    pub telegram_chat_id: Option<Value>,

    #[serde(default)]
    pub discord_enabled: bool,
    #[serde(default)]
    pub discord_webhook_url: Option<String>,

    #[serde(default)]
    pub slack_enabled: bool,
    #[serde(default)]
    pub slack_channel_id: Option<String>,
    #[serde(default)]
    pub slack_access_token: Option<String>,

    #[serde(default)]
    pub whatsapp_enabled: bool,
    #[serde(default)]
    pub whatsapp_phone_number_id: Option<String>,
    #[serde(default)]
    pub whatsapp_access_token: Option<String>,
    #[serde(default)]
    pub whatsapp_recipient: Option<String>,
}

impl LegacyIntegrationConfig {
    pub fn new(organization_id: OrganizationId, form_id: Option<FormId>) -> Self {
        Self {
            organization_id,
            form_id,
            email_enabled: false,
            email_recipients: None,
            webhook_enabled: false,
            webhook_url: None,
            telegram_enabled: false,
            telegram_chat_id: None,
            discord_enabled: false,
            discord_webhook_url: None,
            slack_enabled: false,
            slack_channel_id: None,
            slack_access_token: None,
            whatsapp_enabled: false,
            whatsapp_phone_number_id: None,
            whatsapp_access_token: None,
            whatsapp_recipient: None,
        }
    }
}

/// Expand a legacy row into records of the multi-row model.
///
/// A channel is emitted only when enabled and all its required fields are
/// present; half-configured channels produce nothing.
pub fn normalize_legacy_config(legacy: &LegacyIntegrationConfig) -> Vec<IntegrationRecord> {
    let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
    let mut records = Vec::new();
    let mut emit = |kind: IntegrationType, config: Value| {
        let record = match legacy.form_id {
            Some(form_id) => IntegrationRecord::form(legacy.organization_id, form_id, kind, config),
            None => IntegrationRecord::organization(legacy.organization_id, kind, config),
        };
        records.push(record);
    };

    if legacy.email_enabled {
        let recipients = normalize_recipients(legacy.email_recipients.as_ref());
        if !recipients.is_empty() {
            emit(
                IntegrationType::EmailSmtp,
                serde_json::json!({ "recipients": recipients }),
            );
        }
    }

    if legacy.webhook_enabled && present(&legacy.webhook_url) {
        emit(
            IntegrationType::Webhook,
            serde_json::json!({ "url": legacy.webhook_url }),
        );
    }

    if legacy.telegram_enabled {
        if let Some(chat_id) = legacy
            .telegram_chat_id
            .as_ref()
            .filter(|v| value_text(v).is_some())
        {
            emit(
                IntegrationType::Telegram,
                serde_json::json!({ "chatId": chat_id }),
            );
        }
    }

    if legacy.discord_enabled && present(&legacy.discord_webhook_url) {
        emit(
            IntegrationType::Discord,
            serde_json::json!({ "webhookUrl": legacy.discord_webhook_url }),
        );
    }

    if legacy.slack_enabled
        && present(&legacy.slack_channel_id)
        && present(&legacy.slack_access_token)
    {
        emit(
            IntegrationType::Slack,
            serde_json::json!({
                "channelId": legacy.slack_channel_id,
                "accessToken": legacy.slack_access_token,
            }),
        );
    }

    if legacy.whatsapp_enabled
        && present(&legacy.whatsapp_phone_number_id)
        && present(&legacy.whatsapp_access_token)
        && present(&legacy.whatsapp_recipient)
    {
        emit(
            IntegrationType::Whatsapp,
            serde_json::json!({
                "phoneNumberId": legacy.whatsapp_phone_number_id,
                "accessToken": legacy.whatsapp_access_token,
                "recipient": legacy.whatsapp_recipient,
            }),
        );
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORG: OrganizationId = OrganizationId(1);
    const FORM: FormId = FormId(10);

    fn org(kind: IntegrationType, config: Value) -> IntegrationRecord {
        IntegrationRecord::organization(ORG, kind, config)
    }

    fn form(kind: IntegrationType, config: Value) -> IntegrationRecord {
        IntegrationRecord::form(ORG, FORM, kind, config)
    }

    #[test]
    fn form_record_shadows_org_record_of_same_type() {
        let orgs = vec![
            org(IntegrationType::Slack, json!({"channelId": "C-ORG", "accessToken": "T"})),
            org(IntegrationType::Telegram, json!({"chatId": "1"})),
        ];
        let forms = vec![form(
            IntegrationType::Slack,
            json!({"channelId": "C-FORM", "accessToken": "T"}),
        )];

        let set = resolve(&orgs, &forms, true);

        assert_eq!(set.kinds(), vec![IntegrationType::Telegram, IntegrationType::Slack]);
        let slack: Vec<_> = set
            .iter()
            .filter(|i| i.kind() == IntegrationType::Slack)
            .collect();
        assert_eq!(slack.len(), 1);
        assert_eq!(slack[0].scope, IntegrationScope::Form);
        assert_eq!(
            slack[0].config,
            IntegrationConfig::Slack(SlackConfig {
                channel_id: Some("C-FORM".into()),
                access_token: Some("T".into()),
            })
        );
    }

    #[test]
    fn inactive_form_record_does_not_shadow() {
        let orgs = vec![org(IntegrationType::Discord, json!({"webhookUrl": "https://d/org"}))];
        let forms = vec![form(IntegrationType::Discord, json!({"webhookUrl": "https://d/form"})).inactive()];

        let set = resolve(&orgs, &forms, true);

        assert_eq!(set.len(), 1);
        assert_eq!(set.integrations[0].scope, IntegrationScope::Organization);
    }

    #[test]
    fn opting_out_uses_only_active_form_records() {
        let orgs = vec![
            org(IntegrationType::Webhook, json!({"url": "https://org"})),
            org(IntegrationType::Slack, json!({})),
        ];
        let forms = vec![
            form(IntegrationType::Telegram, json!({"chatId": 5})),
            form(IntegrationType::Discord, json!({})).inactive(),
        ];

        let set = resolve(&orgs, &forms, false);

        assert_eq!(set.kinds(), vec![IntegrationType::Telegram]);
        assert!(set.iter().all(|i| i.scope == IntegrationScope::Form));
    }

    #[test]
    fn inactive_org_records_are_dropped() {
        let orgs = vec![org(IntegrationType::Webhook, json!({"url": "https://org"})).inactive()];
        assert!(resolve(&orgs, &[], true).is_empty());
    }

    #[test]
    fn recipients_accept_string_or_array() {
        assert_eq!(
            normalize_recipients(Some(&json!(" a@x.com, ,b@x.com ,"))),
            vec!["a@x.com", "b@x.com"]
        );
        assert_eq!(
            normalize_recipients(Some(&json!(["  c@x.com", "", 4, "d@x.com"]))),
            vec!["c@x.com", "d@x.com"]
        );
        assert!(normalize_recipients(Some(&json!(42))).is_empty());
        assert!(normalize_recipients(None).is_empty());
    }

    #[test]
    fn recipient_normalization_is_idempotent() {
        let once = normalize_recipients(Some(&json!("a@x.com,  b@x.com")));
        let twice = normalize_recipients(Some(&json!(once.clone())));
        assert_eq!(once, twice);

        let record = form(IntegrationType::EmailSmtp, json!({"recipients": "a@x.com, b@x.com"}));
        let normalized = normalize_record(&record);
        assert_eq!(normalized.config["recipients"], json!(["a@x.com", "b@x.com"]));
        assert_eq!(normalize_record(&normalized).config, normalized.config);
    }

    #[test]
    fn unexpected_shapes_degrade_to_absent() {
        let config = parse_config(
            IntegrationType::Webhook,
            &json!({"url": 12.5, "method": ["GET"], "headers": "nope", "bodyParams": [{"key": "a", "value": "{{formId}}"}, {"value": "x"}]}),
        );
        let IntegrationConfig::Webhook(webhook) = config else {
            panic!("webhook config expected");
        };
        assert_eq!(webhook.url.as_deref(), Some("12.5"));
        assert_eq!(webhook.method, None);
        assert!(webhook.headers.is_empty());
        assert_eq!(webhook.body_params, vec![("a".to_string(), "{{formId}}".to_string())]);

        let config = parse_config(IntegrationType::Slack, &Value::Null);
        assert_eq!(config, IntegrationConfig::Slack(SlackConfig::default()));
    }

    #[test]
    fn legacy_telegram_only_expands_to_one_record() {
        let mut legacy = LegacyIntegrationConfig::new(ORG, Some(FORM));
        legacy.telegram_enabled = true;
        legacy.telegram_chat_id = Some(json!(555));
        legacy.webhook_enabled = false;
        legacy.webhook_url = Some("https://ignored".into());

        let records = normalize_legacy_config(&legacy);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IntegrationType::Telegram);
        assert_eq!(records[0].config["chatId"], json!(555));
        assert_eq!(records[0].scope, IntegrationScope::Form);
        assert_eq!(records[0].form_id, Some(FORM));
        assert_eq!(records[0].id, None);
        assert_eq!(
            parse_config(records[0].kind, &records[0].config),
            IntegrationConfig::Telegram(TelegramConfig {
                chat_id: Some("555".into())
            })
        );

        legacy.telegram_enabled = false;
        assert!(normalize_legacy_config(&legacy).is_empty());
    }

    #[test]
    fn legacy_half_configured_channels_are_skipped() {
        let legacy: LegacyIntegrationConfig = serde_json::from_value(json!({
            "organizationId": 1,
            "emailEnabled": true,
            "emailRecipients": " , ",
            "slackEnabled": true,
            "slackChannelId": "C1",
            "slackAccessToken": "  ",
            "discordEnabled": true,
            "discordWebhookUrl": "https://discord.test/hook",
            "telegramEnabled": true,
            "telegramChatId": ""
        }))
        .expect("legacy row");

        let records = normalize_legacy_config(&legacy);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IntegrationType::Discord);
        assert_eq!(records[0].scope, IntegrationScope::Organization);
    }

    #[test]
    fn legacy_and_new_records_feed_the_same_resolution() {
        let mut legacy = LegacyIntegrationConfig::new(ORG, Some(FORM));
        legacy.email_enabled = true;
        legacy.email_recipients = Some(json!("ops@x.com, sales@x.com"));

        let forms = normalize_legacy_config(&legacy);
        let set = resolve(&[], &forms, true);

        assert_eq!(
            set.integrations[0].config,
            IntegrationConfig::EmailSmtp(SmtpEmailConfig {
                recipients: vec!["ops@x.com".into(), "sales@x.com".into()],
                ..Default::default()
            })
        );
    }
}
