#![forbid(unsafe_code)]

use mb_engines::transport::{AttributionTransport, TransportConfig};
use mb_engines::{AttributionPolicy, StaticEnvironment};
use mb_kernel_contracts::attribution::{AttributionRecord, UtmParams};
use mb_kernel_contracts::fingerprint::EnvironmentAttributes;
use mb_kernel_contracts::message::{ContextMessage, ContextResponse, MessageAction};
use mb_kernel_contracts::transport::RecoveryMethod;
use mb_kernel_contracts::UnixTimeMs;
use mb_os::background::UserPropertiesReply;
use mb_os::{request_with_timeout, BackgroundContext, ChannelError, UnavailableChannel};
use mb_storage::ExtensionStorage;

const NOW: UnixTimeMs = UnixTimeMs(1_712_000_000_000);

fn env() -> StaticEnvironment {
    StaticEnvironment(EnvironmentAttributes {
        timezone: Some("Asia/Tokyo".to_string()),
        language: Some("ja".to_string()),
        ..EnvironmentAttributes::default()
    })
}

fn record() -> AttributionRecord {
    AttributionRecord {
        utm: UtmParams::from_pairs([
            ("utm_source", "youtube"),
            ("utm_medium", "video"),
            ("utm_content", "review"),
        ]),
        referrer: Some("https://www.youtube.com/".to_string()),
        captured_at: NOW,
        ..AttributionRecord::default()
    }
}

fn start(storage: ExtensionStorage) -> BackgroundContext<ExtensionStorage> {
    BackgroundContext::start(
        storage,
        &env(),
        AttributionPolicy::mvp_v1(),
        TransportConfig::mvp_v1(),
        NOW,
    )
}

#[tokio::test]
async fn at_handoff_bg_01_store_fetch_and_properties_over_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (channel, serving) = start(ExtensionStorage::for_path(dir.path().join("local.json"))).spawn(4);

    let store = AttributionTransport::store_message(&record(), Some(RecoveryMethod::Cookie), NOW).unwrap();
    let stored = request_with_timeout(&channel, store, 1_000).await.unwrap();
    assert!(stored.success);

    let fetched = request_with_timeout(&channel, ContextMessage::fetch_attribution(), 1_000)
        .await
        .unwrap();
    let got: AttributionRecord = serde_json::from_value(fetched.data.unwrap()).unwrap();
    assert_eq!(got, record());

    let props = request_with_timeout(&channel, ContextMessage::fetch_user_properties(), 1_000)
        .await
        .unwrap();
    let reply: UserPropertiesReply = serde_json::from_value(props.data.unwrap()).unwrap();
    assert_eq!(reply.properties["initial_utm_content"], "review");
    assert_eq!(reply.properties["initial_referrer"], "https://www.youtube.com/");
    assert_eq!(reply.properties["recovery_method"], "cookie");
    assert_eq!(reply.install_date, None);

    drop(channel);
    serving.await.unwrap();
}

#[tokio::test]
async fn at_handoff_bg_02_stored_attribution_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.json");

    let mut first = start(ExtensionStorage::for_path(path.clone()));
    let store = AttributionTransport::store_message(&record(), None, NOW).unwrap();
    assert!(first.handle(store, NOW).success);
    let user_id = first.identity().user_id.clone();
    drop(first);

    let mut second = start(ExtensionStorage::for_path(path));
    assert_eq!(second.identity().user_id, user_id);
    let fetched = second.handle(ContextMessage::fetch_attribution(), NOW.saturating_add_ms(1_000));
    let got: AttributionRecord = serde_json::from_value(fetched.data.unwrap()).unwrap();
    assert_eq!(got.utm.utm_source.as_deref(), Some("youtube"));
}

#[tokio::test]
async fn at_handoff_bg_03_unknown_shapes_are_refused_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut background = start(ExtensionStorage::for_path(dir.path().join("local.json")));
    let bogus = ContextMessage {
        action: MessageAction::StoreAttribution,
        data: Some(serde_json::json!(["not", "an", "object"])),
    };
    let response = background.handle(bogus, NOW);
    assert!(!response.success);
    assert!(response.error.is_some());
    assert_eq!(
        background.handle(ContextMessage::fetch_attribution(), NOW),
        ContextResponse::ok(None)
    );
}

#[tokio::test]
async fn at_handoff_bg_04_missing_extension_is_reported_as_unavailable() {
    let got = request_with_timeout(&UnavailableChannel, ContextMessage::fetch_attribution(), 1_000).await;
    assert_eq!(got, Err(ChannelError::Unavailable));
}

#[test]
fn at_handoff_bg_05_corrupt_storage_still_yields_one_stable_user_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.json");
    std::fs::write(&path, "{not json").unwrap();

    let first = start(ExtensionStorage::for_path(path.clone()));
    let user_id = first.identity().user_id.clone();
    drop(first);

    let second = start(ExtensionStorage::for_path(path));
    assert_eq!(second.identity().user_id, user_id);
}
