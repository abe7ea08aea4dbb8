//! `{{placeholder}}` rendering for webhook requests.
//!
//! Supported tokens: `{{formData}}`, `{{submissionId}}`, `{{formId}}`,
//! `{{formName}}`, `{{timestamp}}` and `{{field.<name>}}`. Unknown tokens
//! are left as written.

use chrono::{SecondsFormat, Utc};
use reqwest::{Method, Url};
use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::format::field_text;
use crate::types::{FormData, FormId, IntegrationJob, SubmissionId, TemplatePairs, WebhookConfig};

/// Values placeholders resolve against.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub form_data: &'a FormData,
    pub submission_id: SubmissionId,
    pub form_id: FormId,
    pub form_name: &'a str,
    /// Send time, fixed once per request so every `{{timestamp}}` agrees.
    pub timestamp: String,
}

impl<'a> TemplateContext<'a> {
    pub fn new(
        form_data: &'a FormData,
        submission_id: SubmissionId,
        form_id: FormId,
        form_name: &'a str,
    ) -> Self {
        Self {
            form_data,
            submission_id,
            form_id,
            form_name,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn from_job(job: &'a IntegrationJob) -> Self {
        Self::new(&job.form_data, job.submission_id, job.form_id, &job.form_name)
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    fn lookup(&self, token: &str) -> Option<String> {
        match token {
            "submissionId" => Some(self.submission_id.to_string()),
            "formId" => Some(self.form_id.to_string()),
            "formName" => Some(self.form_name.to_string()),
            "timestamp" => Some(self.timestamp.clone()),
            _ => {
                let name = token.strip_prefix("field.")?;
                Some(self.form_data.get(name).map(field_text).unwrap_or_default())
            }
        }
    }
}

/// Replace every known token in `template` with its string value.
pub fn interpolate(template: &str, ctx: &TemplateContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let token = after[..end].trim();
        match ctx.lookup(token) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Resolve one template value.
///
/// A value that is exactly `{{formData}}` becomes the form data object;
/// anything else is interpolated into a string.
pub fn resolve_value(template: &str, ctx: &TemplateContext<'_>) -> Value {
    if exact_token(template) == Some("formData") {
        return Value::Object(ctx.form_data.clone());
    }
    Value::String(interpolate(template, ctx))
}

fn exact_token(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}

/// JSON body: configured params, or the form data plus a `_meta` block.
pub fn build_body(params: &TemplatePairs, ctx: &TemplateContext<'_>) -> Value {
    if params.is_empty() {
        return default_body(ctx);
    }
    let body: Map<String, Value> = params
        .iter()
        .map(|(key, template)| (key.clone(), resolve_value(template, ctx)))
        .collect();
    Value::Object(body)
}

pub fn default_body(ctx: &TemplateContext<'_>) -> Value {
    let mut body = ctx.form_data.clone();
    body.insert(
        "_meta".to_string(),
        serde_json::json!({
            "submissionId": ctx.submission_id,
            "formId": ctx.form_id,
            "formName": ctx.form_name,
            "timestamp": ctx.timestamp,
        }),
    );
    Value::Object(body)
}

/// Interpolated key/value pairs for query strings and headers.
pub fn build_pairs(pairs: &TemplatePairs, ctx: &TemplateContext<'_>) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(key, template)| (key.clone(), interpolate(template, ctx)))
        .collect()
}

/// `Cookie` header value from the cookie map, if any.
pub fn build_cookie_header(cookies: &TemplatePairs, ctx: &TemplateContext<'_>) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let header = build_pairs(cookies, ctx)
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    Some(header)
}

/// Configured method, POST when unset.
pub fn parse_method(method: Option<&str>) -> Result<Method, HandlerError> {
    let Some(method) = method.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(Method::POST);
    };
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| HandlerError::permanent(format!("invalid webhook method: {method}")))
}

pub fn method_allows_body(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    )
}

/// A webhook request ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub body: Option<Value>,
}

/// Build the full request for a webhook integration.
///
/// Fails permanently when the URL is missing or does not parse.
pub fn render_request(
    config: &WebhookConfig,
    ctx: &TemplateContext<'_>,
) -> Result<RenderedRequest, HandlerError> {
    let raw_url = config.url.as_deref().ok_or_else(|| HandlerError::config("url"))?;
    let method = parse_method(config.method.as_deref())?;

    let mut url = Url::parse(&interpolate(raw_url, ctx))
        .map_err(|e| HandlerError::permanent(format!("invalid webhook url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HandlerError::permanent(format!(
            "invalid webhook url scheme: {}",
            url.scheme()
        )));
    }

    let query = build_pairs(&config.query_params, ctx);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    let body = method_allows_body(&method).then(|| build_body(&config.body_params, ctx));

    Ok(RenderedRequest {
        method,
        url,
        headers: build_pairs(&config.headers, ctx),
        cookie: build_cookie_header(&config.cookies, ctx),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form_data() -> FormData {
        match json!({"email": "a@b.com", "tags": ["x", "y"]}) {
            Value::Object(map) => map,
            _ => FormData::new(),
        }
    }

    fn pairs(items: &[(&str, &str)]) -> TemplatePairs {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn body_params_interpolate_as_strings() {
        let data = form_data();
        let ctx = TemplateContext::new(&data, SubmissionId(7), FormId(3), "Contact");

        let body = build_body(
            &pairs(&[("email_field", "{{field.email}}"), ("sub", "{{submissionId}}")]),
            &ctx,
        );

        assert_eq!(body, json!({"email_field": "a@b.com", "sub": "7"}));
    }

    #[test]
    fn exact_form_data_token_yields_object() {
        let data = form_data();
        let ctx = TemplateContext::new(&data, SubmissionId(7), FormId(3), "Contact");

        assert_eq!(resolve_value("{{formData}}", &ctx), Value::Object(data.clone()));
        assert_eq!(resolve_value(" {{ formData }} ", &ctx), Value::Object(data.clone()));
        assert_eq!(
            resolve_value("data: {{formData}}", &ctx),
            json!("data: {{formData}}")
        );
    }

    #[test]
    fn mixed_strings_interpolate_every_token() {
        let data = form_data();
        let ctx = TemplateContext::new(&data, SubmissionId(7), FormId(3), "Contact")
            .with_timestamp("2024-01-01T00:00:00.000Z");

        assert_eq!(
            interpolate(
                "{{formName}}#{{formId}}/{{submissionId}} at {{timestamp}} {{field.tags}}{{field.missing}} {{unknown}} {{open",
                &ctx
            ),
            "Contact#3/7 at 2024-01-01T00:00:00.000Z x, y {{unknown}} {{open"
        );
    }

    #[test]
    fn default_body_carries_meta_block() {
        let data = form_data();
        let ctx = TemplateContext::new(&data, SubmissionId(7), FormId(3), "Contact")
            .with_timestamp("t");

        let body = build_body(&Vec::new(), &ctx);

        assert_eq!(body["email"], json!("a@b.com"));
        assert_eq!(
            body["_meta"],
            json!({"submissionId": 7, "formId": 3, "formName": "Contact", "timestamp": "t"})
        );
    }

    #[test]
    fn get_requests_carry_query_but_no_body() {
        let data = form_data();
        let ctx = TemplateContext::new(&data, SubmissionId(7), FormId(3), "Contact");
        let config = WebhookConfig {
            url: Some("https://hooks.test/forms/{{formId}}".into()),
            method: Some("get".into()),
            query_params: pairs(&[("who", "{{field.email}}")]),
            headers: pairs(&[("X-Form", "{{formName}}")]),
            cookies: pairs(&[("session", "abc"), ("sub", "{{submissionId}}")]),
            body_params: pairs(&[("ignored", "1")]),
            secret: None,
        };

        let request = render_request(&config, &ctx).expect("renders");

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.as_str(), "https://hooks.test/forms/3?who=a%40b.com");
        assert_eq!(request.headers, vec![("X-Form".to_string(), "Contact".to_string())]);
        assert_eq!(request.cookie.as_deref(), Some("session=abc; sub=7"));
        assert_eq!(request.body, None);
    }

    #[test]
    fn method_defaults_to_post_with_body() {
        assert_eq!(parse_method(None).expect("default"), Method::POST);
        assert_eq!(parse_method(Some("  ")).expect("blank"), Method::POST);
        assert!(method_allows_body(&Method::PUT));
        for method in [Method::GET, Method::HEAD, Method::DELETE, Method::OPTIONS] {
            assert!(!method_allows_body(&method));
        }
        assert!(parse_method(Some("NOT A METHOD")).is_err());
    }

    #[test]
    fn missing_or_bad_url_is_permanent() {
        let data = form_data();
        let ctx = TemplateContext::new(&data, SubmissionId(1), FormId(1), "F");

        let missing = render_request(&WebhookConfig::default(), &ctx).unwrap_err();
        assert!(missing.is_permanent());

        let bad = WebhookConfig {
            url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(render_request(&bad, &ctx).unwrap_err().is_permanent());

        let ftp = WebhookConfig {
            url: Some("ftp://files.test/".into()),
            ..Default::default()
        };
        assert!(render_request(&ftp, &ctx).unwrap_err().is_permanent());
    }
}
