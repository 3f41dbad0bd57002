//! Channel configuration loading.
//!
//! Three sources feed the property store, later ones overriding earlier
//! ones: a configuration file (`--mq-config`, JSON or the line-oriented
//! `chans.<name>.<sub>.<field>=value` format), inline definitions
//! (`--channel-config name=foo,type=push,...`), and programmatic
//! `add_channel` calls. Everything lands under `chans.*` properties; the
//! device materializes [`SocketConfig`]s from those keys when it enters
//! `InitializingDevice`.

use crate::channel::{Method, SocketConfig};
use crate::error::ConfigError;
use crate::properties::{Property, PropertyStore};
use crate::transport::{SocketType, Transport};
use std::collections::BTreeMap;
use std::path::Path;

const CHANNEL_FIELDS: [&str; 10] = [
    "type",
    "method",
    "address",
    "transport",
    "sndBufSize",
    "rcvBufSize",
    "sndKernelSize",
    "rcvKernelSize",
    "linger",
    "rateLogging",
];

fn check_field(key: &str) -> Result<(), ConfigError> {
    if CHANNEL_FIELDS.contains(&key) {
        Ok(())
    } else {
        Err(ConfigError::Parse {
            input: key.to_owned(),
            reason: "unknown channel field".to_owned(),
        })
    }
}

/// Parse `--channel-config` occurrences into `chans.*` properties.
///
/// Each occurrence is a comma-separated `key=value` list. The channel is
/// selected either by a leading `name=foo` pair or by a `foo:` prefix. A
/// repeated `address` key starts the next sub-socket; other keys apply to
/// the current one.
pub fn parse_suboptions(entries: &[String]) -> Result<Vec<(String, Property)>, ConfigError> {
    let mut out = Vec::new();
    for entry in entries {
        let (name, rest) = match entry.split_once(':') {
            Some((prefix, rest)) if !prefix.contains('=') && !prefix.contains(',') => {
                (Some(prefix.to_owned()), rest)
            }
            _ => (None, entry.as_str()),
        };
        let mut name = name;
        let mut sub = 0usize;
        let mut seen_address = false;
        for pair in rest.split(',') {
            let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::Parse {
                input: pair.to_owned(),
                reason: "expected key=value".to_owned(),
            })?;
            if key == "name" {
                name = Some(value.to_owned());
                continue;
            }
            let name = name.as_deref().ok_or_else(|| ConfigError::Parse {
                input: entry.clone(),
                reason: "channel name missing (use name=... or a \"chan:\" prefix)".to_owned(),
            })?;
            check_field(key)?;
            if key == "address" {
                if seen_address {
                    sub += 1;
                }
                seen_address = true;
            }
            out.push((
                format!("chans.{name}.{sub}.{key}"),
                Property::String(value.to_owned()),
            ));
        }
    }
    Ok(out)
}

/// Load a channel configuration file. `.json` files carry a `chans` map of
/// channel name to sub-socket object(s); anything else is the line format
/// `chans.<name>.<sub>.<field>=value` with `#` comments.
pub fn load_config_file(path: &Path) -> Result<Vec<(String, Property)>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if path.extension().map_or(false, |ext| ext == "json") {
        parse_json_config(&text).map_err(|reason| ConfigError::File {
            path: path.display().to_string(),
            reason,
        })
    } else {
        parse_line_config(&text)
    }
}

fn parse_line_config(text: &str) -> Result<Vec<(String, Property)>, ConfigError> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
            input: line.to_owned(),
            reason: "expected key=value".to_owned(),
        })?;
        let (key, value) = (key.trim(), value.trim());
        let mut parts = key.splitn(4, '.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("chans"), Some(name), Some(sub), Some(field))
                if !name.is_empty() && sub.parse::<usize>().is_ok() =>
            {
                check_field(field)?;
            }
            _ => {
                return Err(ConfigError::Parse {
                    input: key.to_owned(),
                    reason: "expected chans.<name>.<sub>.<field>".to_owned(),
                })
            }
        }
        out.push((key.to_owned(), Property::String(value.to_owned())));
    }
    Ok(out)
}

fn parse_json_config(text: &str) -> Result<Vec<(String, Property)>, String> {
    let root: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let chans = root
        .get("chans")
        .and_then(|v| v.as_object())
        .ok_or("missing top-level \"chans\" object")?;
    let mut out = Vec::new();
    for (name, value) in chans {
        let subs: Vec<&serde_json::Value> = match value {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for (sub, fields) in subs.iter().enumerate() {
            let fields = fields
                .as_object()
                .ok_or_else(|| format!("channel \"{name}\" sub {sub} is not an object"))?;
            for (field, v) in fields {
                check_field(field).map_err(|e| e.to_string())?;
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push((
                    format!("chans.{name}.{sub}.{field}"),
                    Property::String(text),
                ));
            }
        }
    }
    Ok(out)
}

/// Materialize channel configurations from the `chans.*` properties.
pub fn channels_from_properties(
    props: &PropertyStore,
) -> Result<BTreeMap<String, Vec<SocketConfig>>, ConfigError> {
    let mut channels: BTreeMap<String, BTreeMap<usize, SocketConfig>> = BTreeMap::new();
    for (key, value) in props.with_prefix("chans.") {
        let mut parts = key.splitn(4, '.');
        let (_, name, sub, field) = (
            parts.next(),
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
        );
        let sub: usize = sub.parse().map_err(|_| ConfigError::Parse {
            input: key.clone(),
            reason: "sub-socket index is not a number".to_owned(),
        })?;
        let value = value.to_string();
        let config = channels
            .entry(name.to_owned())
            .or_default()
            .entry(sub)
            .or_default();
        apply_field(config, &key, field, &value)?;
    }

    let mut out = BTreeMap::new();
    for (name, subs) in channels {
        // Sub indices must be dense; BTreeMap ordering gives them sorted.
        let subs: Vec<SocketConfig> = subs.into_values().collect();
        out.insert(name, subs);
    }
    Ok(out)
}

fn apply_field(
    config: &mut SocketConfig,
    key: &str,
    field: &str,
    value: &str,
) -> Result<(), ConfigError> {
    let bad = |reason: String| ConfigError::InvalidProperty {
        key: key.to_owned(),
        reason,
    };
    let parse_i32 = |value: &str| {
        value
            .parse::<i32>()
            .map_err(|_| bad(format!("\"{value}\" is not an integer")))
    };
    match field {
        "type" => {
            config.socket_type = value
                .parse::<SocketType>()
                .map_err(|e| bad(e.to_string()))?
        }
        "method" => config.method = value.parse::<Method>().map_err(|e| bad(e.to_string()))?,
        "address" => config.address = value.to_owned(),
        "transport" => {
            config.transport = value.parse::<Transport>().map_err(|e| bad(e.to_string()))?
        }
        "sndBufSize" => config.snd_buf_size = parse_i32(value)?,
        "rcvBufSize" => config.rcv_buf_size = parse_i32(value)?,
        "sndKernelSize" => config.snd_kernel_size = parse_i32(value)?,
        "rcvKernelSize" => config.rcv_kernel_size = parse_i32(value)?,
        "linger" => config.linger = parse_i32(value)?,
        "rateLogging" => config.rate_logging = parse_i32(value)?,
        other => return Err(bad(format!("unknown channel field \"{other}\""))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventManager;
    use std::sync::Arc;

    fn store_with(pairs: Vec<(String, Property)>) -> PropertyStore {
        let store = PropertyStore::new(Arc::new(EventManager::new()));
        for (k, v) in pairs {
            store.set(&k, v);
        }
        store
    }

    #[test]
    fn suboptions_with_name_selector() {
        let parsed = parse_suboptions(&[
            "name=foo-data,address=tcp://0.0.0.0:6000,type=push".to_owned(),
            "bar-data:address=tcp://0.0.0.0:7000,type=pull".to_owned(),
        ])
        .unwrap();
        let get = |key: &str| {
            parsed
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.to_string())
        };
        assert_eq!(
            get("chans.foo-data.0.address").as_deref(),
            Some("tcp://0.0.0.0:6000")
        );
        assert_eq!(get("chans.foo-data.0.type").as_deref(), Some("push"));
        assert_eq!(
            get("chans.bar-data.0.address").as_deref(),
            Some("tcp://0.0.0.0:7000")
        );
        assert_eq!(get("chans.bar-data.0.type").as_deref(), Some("pull"));
    }

    #[test]
    fn repeated_address_starts_next_sub_socket() {
        let parsed = parse_suboptions(&[
            "name=data,type=push,address=tcp://*:6000,address=tcp://*:6001".to_owned(),
        ])
        .unwrap();
        assert!(parsed.iter().any(|(k, _)| k == "chans.data.0.address"));
        assert!(parsed.iter().any(|(k, _)| k == "chans.data.1.address"));
    }

    #[test]
    fn missing_name_is_an_error() {
        assert!(parse_suboptions(&["type=push,address=tcp://*:1".to_owned()]).is_err());
    }

    #[test]
    fn line_format_parses_and_rejects_garbage() {
        let parsed = parse_line_config(
            "# channels of the sink\n\
             chans.data.0.type=pull\n\
             chans.data.0.method=connect\n\
             chans.data.0.address=tcp://127.0.0.1:5555\n",
        )
        .unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parse_line_config("data.0.type=pull\n").is_err());
        assert!(parse_line_config("chans.data.0.bogus=1\n").is_err());
    }

    #[test]
    fn json_format_parses() {
        let parsed = parse_json_config(
            r#"{ "chans": { "data": [
                 { "type": "rep", "method": "bind",
                   "address": "tcp://*:5555", "rateLogging": 0 }
               ] } }"#,
        )
        .unwrap();
        let store = store_with(parsed);
        let channels = channels_from_properties(&store).unwrap();
        let subs = &channels["data"];
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].socket_type, SocketType::Rep);
        assert_eq!(subs[0].method, Method::Bind);
        assert_eq!(subs[0].address, "tcp://*:5555");
        assert_eq!(subs[0].rate_logging, 0);
    }

    #[test]
    fn properties_materialize_with_defaults_for_missing_fields() {
        let store = store_with(
            parse_suboptions(&["name=data,type=pub,method=bind,address=tcp://*:9000".to_owned()])
                .unwrap(),
        );
        let channels = channels_from_properties(&store).unwrap();
        let sub = &channels["data"][0];
        assert_eq!(sub.socket_type, SocketType::Pub);
        assert_eq!(sub.snd_buf_size, crate::defaults::SND_BUF_SIZE);
        assert_eq!(sub.transport, Transport::Default);
    }
}
