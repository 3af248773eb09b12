#![forbid(unsafe_code)]

use std::fs;

use mb_engines::fingerprint::{canonical_attribute_string, FingerprintGenerator};
use mb_engines::transport::decode_cookie_value;
use mb_engines::AttributionTransport;
use mb_kernel_contracts::attribution::{AttributionRecord, UtmParams};
use mb_kernel_contracts::fingerprint::{DeviceFingerprint, EnvironmentAttributes};
use mb_kernel_contracts::identity::{ResolvedIdentity, UserIdentifier};
use mb_kernel_contracts::transport::query_params;
use mb_kernel_contracts::UnixTimeMs;
use url::Url;

pub const USAGE: &str = "usage: mbattr <fingerprint <attributes.json> | validate-fp <fp> | parse-uid <uid> | decode-cookie <value> | handoff-url <base> <uid> <did> [key=value...]>";

pub fn execute_attr_command(args: &[String], now: UnixTimeMs) -> Result<String, String> {
    let subcommand = args.first().ok_or_else(|| USAGE.to_string())?;
    let rest = &args[1..];
    match subcommand.as_str() {
        "fingerprint" => {
            let path = require_arg(rest, 0, "attributes file")?;
            let raw = fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))?;
            fingerprint_report(&raw)
        }
        "validate-fp" => {
            let raw = require_arg(rest, 0, "fingerprint")?;
            DeviceFingerprint::parse(raw)
                .map(|_| "VALID".to_string())
                .map_err(|e| format!("INVALID: {e}"))
        }
        "parse-uid" => {
            let raw = require_arg(rest, 0, "user id")?;
            let uid = UserIdentifier::parse(raw).map_err(|e| format!("INVALID: {e}"))?;
            let parts = uid.components();
            Ok([
                format!("source={}", parts.source),
                format!(
                    "minted_at={}",
                    parts.minted_at.map(|t| t.0.to_string()).unwrap_or_else(|| "-".to_string())
                ),
                format!("fingerprint_fragment={}", parts.fingerprint_fragment),
                format!("random={}", parts.random),
            ]
            .join("\n"))
        }
        "decode-cookie" => {
            let raw = require_arg(rest, 0, "cookie value")?;
            let cookie = decode_cookie_value(raw).map_err(|e| format!("failed to decode cookie: {e}"))?;
            Ok([
                format!("uid={}", cookie.uid),
                format!("did={}", cookie.did),
                format!("utm={}", cookie.utm.as_deref().unwrap_or("-")),
            ]
            .join("\n"))
        }
        "handoff-url" => handoff_url(rest, now),
        _ => Err(format!(
            "unknown subcommand: {subcommand}. expected one of: fingerprint, validate-fp, parse-uid, decode-cookie, handoff-url"
        )),
    }
}

fn require_arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {what}. {USAGE}"))
}

fn fingerprint_report(raw: &str) -> Result<String, String> {
    let attrs: EnvironmentAttributes =
        serde_json::from_str(raw).map_err(|e| format!("invalid attributes json: {e}"))?;
    Ok(format!(
        "fingerprint={}\ncanonical={}",
        FingerprintGenerator::from_attributes(&attrs),
        canonical_attribute_string(&attrs)
    ))
}

fn handoff_url(args: &[String], now: UnixTimeMs) -> Result<String, String> {
    let base = Url::parse(require_arg(args, 0, "base url")?).map_err(|e| format!("invalid base url: {e}"))?;
    let user_id = UserIdentifier::parse(require_arg(args, 1, "user id")?).map_err(|e| format!("invalid uid: {e}"))?;
    let device_id =
        DeviceFingerprint::parse(require_arg(args, 2, "device id")?).map_err(|e| format!("invalid did: {e}"))?;

    let mut pairs = Vec::new();
    for raw in &args[3.min(args.len())..] {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
        pairs.push((key, value));
    }
    let find = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    };
    let record = AttributionRecord {
        utm: UtmParams::from_pairs(pairs.iter().copied()),
        referrer: find(query_params::REFERRER),
        landing_page: find(query_params::LANDING_PAGE),
        captured_at: now,
        referral_code: find(query_params::REFERRAL),
        extension_id: find(query_params::EXTENSION_ID),
        version: find(query_params::VERSION),
        install_date: find(query_params::INSTALL_DATE),
        ..AttributionRecord::default()
    };
    let identity = ResolvedIdentity {
        local_fingerprint: device_id.clone(),
        user_id,
        device_id,
    };
    let payload = AttributionTransport::default()
        .snapshot(&identity, Some(&record), None, now)
        .map_err(|e| format!("invalid hand-off: {e}"))?;
    Ok(AttributionTransport::handoff_url(&base, &payload).to_string())
}
