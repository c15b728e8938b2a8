use crate::filter::Scalar;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One logged gateway request, as stored in the log index.
///
/// Fields are declared in key order so JSON output lists them that way.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gatekeeper_denied_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_accept_encoding: Option<String>,
    #[serde(
        serialize_with = "serialize_request_at",
        deserialize_with = "deserialize_request_at"
    )]
    pub request_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ip_city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ip_country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ip_region: Option<String>,
    #[serde(default)]
    pub request_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    /// Parsed query string. Keys are unique; order carries no meaning.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "deserialize_query"
    )]
    pub request_query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_referer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl LogRecord {
    pub fn new(request_at: DateTime<Utc>) -> Self {
        Self {
            request_at,
            request_method: "GET".to_string(),
            ..Default::default()
        }
    }

    /// Value of a field by its backend name, `None` when absent.
    pub fn field(&self, name: &str) -> Option<Scalar> {
        let text = |v: &Option<String>| v.as_ref().map(|s| Scalar::Text(s.clone()));
        match name {
            "request_at" => Some(Scalar::Time(self.request_at)),
            "request_method" => Some(Scalar::Text(self.request_method.clone())),
            "request_scheme" => text(&self.request_scheme),
            "request_host" => text(&self.request_host),
            "request_path" => text(&self.request_path),
            "request_url" => text(&self.request_url),
            "user_email" => text(&self.user_email),
            "request_ip" => text(&self.request_ip),
            "request_ip_country" => text(&self.request_ip_country),
            "request_ip_region" => text(&self.request_ip_region),
            "request_ip_city" => text(&self.request_ip_city),
            "response_status" => self.response_status.map(|s| Scalar::Number(f64::from(s))),
            "gatekeeper_denied_code" => text(&self.gatekeeper_denied_code),
            "response_time" => self.response_time.map(Scalar::Number),
            "response_content_type" => text(&self.response_content_type),
            "request_accept_encoding" => text(&self.request_accept_encoding),
            "request_user_agent" => text(&self.request_user_agent),
            "request_referer" => text(&self.request_referer),
            "api_key" => text(&self.api_key),
            _ => None,
        }
    }

    /// Mutable access to every free-form string attribute.
    pub fn text_fields_mut(&mut self) -> impl Iterator<Item = &mut String> {
        [
            &mut self.request_scheme,
            &mut self.request_host,
            &mut self.request_path,
            &mut self.request_url,
            &mut self.user_email,
            &mut self.request_ip,
            &mut self.request_ip_country,
            &mut self.request_ip_region,
            &mut self.request_ip_city,
            &mut self.gatekeeper_denied_code,
            &mut self.response_content_type,
            &mut self.request_accept_encoding,
            &mut self.request_user_agent,
            &mut self.request_referer,
        ]
        .into_iter()
        .flatten()
        .chain(std::iter::once(&mut self.request_method))
    }
}

fn serialize_request_at<S: Serializer>(at: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Indexes store `request_at` either as an RFC 3339 string or epoch millis.
fn deserialize_request_at<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    match Raw::deserialize(d)? {
        Raw::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| serde::de::Error::custom("request_at out of range")),
        Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| serde::de::Error::custom("request_at is not an RFC 3339 timestamp")),
    }
}

/// Query maps may hold numbers or repeated keys; flatten everything to strings.
fn deserialize_query<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(d)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| scalar_string(&v).map(|v| (k, v)))
        .collect())
}

fn scalar_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(scalar_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_epoch_millis_and_rfc3339() {
        let a: LogRecord = serde_json::from_str(r#"{"request_at":1421388388816}"#).unwrap();
        let b: LogRecord =
            serde_json::from_str(r#"{"request_at":"2015-01-16T06:06:28.816Z"}"#).unwrap();
        assert_eq!(a.request_at, b.request_at);
    }

    #[test]
    fn request_query_values_coerced_to_strings() {
        let rec: LogRecord = serde_json::from_str(
            r#"{"request_at":0,"request_query":{"page":2,"tag":["a","b"],"gone":null,"foo":"bar"}}"#,
        )
        .unwrap();
        assert_eq!(rec.request_query["page"], "2");
        assert_eq!(rec.request_query["tag"], "a,b");
        assert_eq!(rec.request_query["foo"], "bar");
        assert!(!rec.request_query.contains_key("gone"));
    }

    #[test]
    fn serializes_in_key_order_and_omits_absent() {
        let mut rec = LogRecord::new(Utc.with_ymd_and_hms(2015, 1, 16, 6, 6, 28).unwrap());
        rec.request_host = Some("example.com".into());
        let json = serde_json::to_string(&rec).unwrap();
        assert_eq!(
            json,
            r#"{"request_at":"2015-01-16T06:06:28.000Z","request_host":"example.com","request_method":"GET"}"#
        );
    }

    #[test]
    fn field_lookup_by_backend_name() {
        let mut rec = LogRecord::new(Utc::now());
        rec.response_status = Some(404);
        assert_eq!(rec.field("response_status"), Some(Scalar::Number(404.0)));
        assert_eq!(rec.field("gatekeeper_denied_code"), None);
        assert_eq!(rec.field("no_such_field"), None);
    }
}
