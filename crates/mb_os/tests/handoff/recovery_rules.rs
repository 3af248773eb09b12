#![forbid(unsafe_code)]

use mb_engines::policy::MINUTE_MS;
use mb_engines::{
    AttributionPolicy, AttributionRecorder, IdentifierStore, PageVisit, RecordOutcome,
};
use mb_kernel_contracts::attribution::{AttributionRecord, InstallIntentRecord, UtmParams};
use mb_kernel_contracts::fingerprint::DeviceFingerprint;
use mb_kernel_contracts::identity::{IdentifierSource, ResolvedIdentity, UserIdentifier};
use mb_kernel_contracts::transport::RecoveryMethod;
use mb_kernel_contracts::{storage_keys, UnixTimeMs};
use mb_os::reconciler::{AttributionReconciler, Corroboration, LocalEvidence, RecoverySources};
use mb_os::InProcessChannel;
use mb_storage::{write_stamped, BrowserProfile, CookieJar, KeyValueBackend, MemoryBackend, StorageMedium};
use url::Url;

const NOW: UnixTimeMs = UnixTimeMs(1_712_000_000_000);
const HOST: &str = "welcome.monkey-block.com";

fn local_fp() -> DeviceFingerprint {
    DeviceFingerprint::parse("fp_welcome_1").unwrap()
}

fn other_fp() -> DeviceFingerprint {
    DeviceFingerprint::parse("fp_website_2").unwrap()
}

fn stored_record(source: &str) -> AttributionRecord {
    AttributionRecord {
        utm: UtmParams::from_pairs([("utm_source", source)]),
        captured_at: NOW.saturating_sub_ms(10 * MINUTE_MS),
        fingerprint: Some(other_fp()),
        user_id: Some(UserIdentifier::parse("user_web_1711990000000_website_aaaaaaaaa").unwrap()),
        ..AttributionRecord::default()
    }
}

fn intent_aged(minutes: u64) -> InstallIntentRecord {
    InstallIntentRecord {
        created_at: NOW.saturating_sub_ms(minutes * MINUTE_MS),
        button_location: "hero".to_string(),
        button_text: Some("Add to Chrome".to_string()),
        page_path: Some("/".to_string()),
    }
}

fn evidence(intent: Option<InstallIntentRecord>) -> LocalEvidence {
    LocalEvidence {
        fingerprint: local_fp(),
        stored_user_id: None,
        install_intent: intent,
    }
}

#[tokio::test]
async fn at_handoff_rules_01_url_parameters_beat_local_storage() {
    let mut page = MemoryBackend::acting_as(StorageMedium::PageStorage);
    write_stamped(&mut page, storage_keys::LANDING_ATTRIBUTION, &stored_record("google"), NOW).unwrap();
    let jar = CookieJar::new();
    let url = Url::parse(
        "https://welcome.monkey-block.com/?uid=user_web_1711999000000_abcdefgh_zzzzzzzzz\
         &did=fp_abcdefgh_k2&utm_source=reddit",
    )
    .unwrap();

    let reconciler = AttributionReconciler::new(AttributionPolicy::mvp_v1());
    let sources = RecoverySources::new(&page, &jar, HOST).with_url(&url);
    let got = reconciler
        .recover(&sources, &evidence(Some(intent_aged(1))), NOW)
        .await
        .unwrap();
    assert_eq!(got.method, RecoveryMethod::UrlParametersComplete);
    assert_eq!(got.record.utm.utm_source.as_deref(), Some("reddit"));
}

#[tokio::test]
async fn at_handoff_rules_02_intent_29_minutes_old_corroborates() {
    let mut page = MemoryBackend::acting_as(StorageMedium::PageStorage);
    write_stamped(&mut page, storage_keys::LANDING_ATTRIBUTION, &stored_record("reddit"), NOW).unwrap();
    let jar = CookieJar::new();
    let reconciler = AttributionReconciler::new(AttributionPolicy::mvp_v1());
    let got = reconciler
        .recover(&RecoverySources::new(&page, &jar, HOST), &evidence(Some(intent_aged(29))), NOW)
        .await
        .unwrap();
    assert_eq!(got.method, RecoveryMethod::LocalStorageLanding);
    assert_eq!(got.corroboration, Corroboration::RecentInstallIntent);
}

#[tokio::test]
async fn at_handoff_rules_03_intent_31_minutes_old_is_rejected() {
    let mut page = MemoryBackend::acting_as(StorageMedium::PageStorage);
    write_stamped(&mut page, storage_keys::LANDING_ATTRIBUTION, &stored_record("reddit"), NOW).unwrap();
    let jar = CookieJar::new();
    let reconciler = AttributionReconciler::new(AttributionPolicy::mvp_v1());
    let got = reconciler
        .recover(&RecoverySources::new(&page, &jar, HOST), &evidence(Some(intent_aged(31))), NOW)
        .await;
    assert_eq!(got, None);
}

#[tokio::test]
async fn at_handoff_rules_04_intent_window_follows_policy() {
    let mut page = MemoryBackend::acting_as(StorageMedium::PageStorage);
    write_stamped(&mut page, storage_keys::LANDING_ATTRIBUTION, &stored_record("reddit"), NOW).unwrap();
    let jar = CookieJar::new();
    let policy = AttributionPolicy::from_lookup(|key| {
        (key == "MB_INSTALL_INTENT_WINDOW_MINUTES").then(|| "60".to_string())
    });
    let reconciler = AttributionReconciler::new(policy);
    let got = reconciler
        .recover(&RecoverySources::new(&page, &jar, HOST), &evidence(Some(intent_aged(31))), NOW)
        .await;
    assert_eq!(got.map(|r| r.corroboration), Some(Corroboration::RecentInstallIntent));
}

#[test]
fn at_handoff_rules_05_visit_without_signal_keeps_stored_record() {
    let profile = BrowserProfile::new();
    let mut page = profile.page_storage("https://monkey-block.com");
    let identity = ResolvedIdentity {
        user_id: UserIdentifier::parse("user_web_1711990000000_website_aaaaaaaaa").unwrap(),
        device_id: other_fp(),
        local_fingerprint: other_fp(),
    };
    let recorder = AttributionRecorder::new(AttributionPolicy::mvp_v1());
    let paid = PageVisit::parse("https://monkey-block.com/?utm_source=reddit&utm_campaign=spring", None).unwrap();
    let RecordOutcome::Recorded(first) = recorder.record_if_attributable(&mut page, &paid, &identity, NOW) else {
        panic!("paid visit must be recorded");
    };

    let direct = PageVisit::parse("https://monkey-block.com/features", None).unwrap();
    let later = NOW.saturating_add_ms(MINUTE_MS);
    assert_eq!(
        recorder.record_if_attributable(&mut page, &direct, &identity, later),
        RecordOutcome::NotAttributable
    );
    let internal = PageVisit::parse("https://monkey-block.com/pricing", Some("https://monkey-block.com/features")).unwrap();
    assert_eq!(
        recorder.record_if_attributable(&mut page, &internal, &identity, later),
        RecordOutcome::NotAttributable
    );
    assert_eq!(recorder.load_landing(&mut page, later), Some(first));
}

#[test]
fn at_handoff_rules_06_get_or_create_twice_returns_the_same_identifier() {
    let profile = BrowserProfile::new();
    let mut page = profile.page_storage("https://welcome.monkey-block.com");
    let first = IdentifierStore::new(IdentifierSource::Welcome).get_or_create(&mut page, &local_fp(), NOW);
    let second = IdentifierStore::new(IdentifierSource::Welcome).get_or_create(
        &mut page,
        &local_fp(),
        NOW.saturating_add_ms(5_000),
    );
    assert_eq!(first, second);
    assert_eq!(page.get(storage_keys::USER_ID).unwrap().as_deref(), Some(first.as_str()));
}

#[tokio::test(start_paused = true)]
async fn at_handoff_rules_07_silent_extension_times_out_as_not_found() {
    let page = MemoryBackend::acting_as(StorageMedium::PageStorage);
    let jar = CookieJar::new();
    let (channel, _never_answered) = InProcessChannel::pair(1);
    let reconciler = AttributionReconciler::new(AttributionPolicy::mvp_v1());
    let sources = RecoverySources::new(&page, &jar, HOST).with_channel(&channel);
    let got = reconciler.recover(&sources, &evidence(None), NOW).await;
    assert_eq!(got, None);
}
