#![forbid(unsafe_code)]

use std::sync::Arc;

use mb_engines::analytics::{events, AnalyticsConfig, DeliveryMode, MemoryEventSink};
use mb_engines::transport::TransportConfig;
use mb_engines::{AttributionPolicy, InstallClick, PageVisit, RecordOutcome, StaticEnvironment, UrlHandoff};
use mb_kernel_contracts::fingerprint::EnvironmentAttributes;
use mb_kernel_contracts::transport::RecoveryMethod;
use mb_kernel_contracts::{ExecutionContextKind, UnixTimeMs};
use mb_os::reconciler::Corroboration;
use mb_os::{BackgroundContext, ContextClient, InstallDateSource, InstallDetails, InstallReason};
use mb_storage::{BrowserProfile, MemoryBackend, StorageMedium};
use url::Url;

const VISIT_AT: UnixTimeMs = UnixTimeMs(1_712_000_000_000);
const STORE_URL: &str = "https://chromewebstore.google.com/detail/ggccjkdgmlclpigflghjjkgeblgdgffe";

fn laptop() -> StaticEnvironment {
    StaticEnvironment(EnvironmentAttributes {
        timezone: Some("Europe/Amsterdam".to_string()),
        language: Some("nl-NL".to_string()),
        languages: Some(vec!["nl-NL".to_string(), "en".to_string()]),
        platform: Some("Win32".to_string()),
        hardware_concurrency: Some(12),
        cookie_enabled: Some(true),
        vendor: Some("Google Inc.".to_string()),
        ..EnvironmentAttributes::default()
    })
}

/// Copies the hand-off query of `from` onto `base`, the way a redirect chain would.
fn carry_query(from: &Url, base: &str) -> Url {
    let mut url = Url::parse(base).unwrap();
    url.set_query(from.query());
    url
}

#[tokio::test]
async fn at_handoff_e2e_01_reddit_visit_survives_the_store_hop() {
    let profile = BrowserProfile::new();
    let visit = PageVisit::parse(
        "https://monkey-block.com/?utm_source=reddit&utm_medium=social",
        None,
    )
    .unwrap();
    let mut website = ContextClient::new(
        ExecutionContextKind::Website,
        profile.page_storage("https://monkey-block.com"),
        profile.cookies(),
    )
    .start(&laptop(), &visit, VISIT_AT)
    .await;
    let RecordOutcome::Recorded(landing) = &website.startup().landing else {
        panic!("reddit visit must be recorded");
    };
    assert_eq!(landing.utm.utm_source.as_deref(), Some("reddit"));
    assert_eq!(landing.utm.utm_medium.as_deref(), Some("social"));

    let click_at = VISIT_AT.saturating_add_ms(90_000);
    let store = website.install_click(&InstallClick::new("hero"), &Url::parse(STORE_URL).unwrap(), click_at);
    let sent = UrlHandoff::from_url(&store);
    assert_eq!(sent.user_id.as_ref(), Some(&website.identity().user_id));
    assert_eq!(sent.device_id.as_ref(), Some(&website.identity().device_id));
    assert!(website
        .cookies()
        .get("welcome.monkey-block.com", "mb_attr", click_at)
        .unwrap()
        .is_some());

    let welcome_url = carry_query(&store, "https://welcome.monkey-block.com/");
    let welcome_visit = PageVisit::parse(welcome_url.as_str(), None).unwrap();
    let welcome = ContextClient::new(
        ExecutionContextKind::Welcome,
        profile.page_storage("https://welcome.monkey-block.com"),
        profile.cookies(),
    )
    .start(&laptop(), &welcome_visit, click_at.saturating_add_ms(40_000))
    .await;

    let recovered = welcome.startup().recovered.as_ref().unwrap();
    assert_eq!(recovered.method, RecoveryMethod::UrlParametersComplete);
    assert_eq!(recovered.corroboration, Corroboration::ExplicitHandoff);
    assert_eq!(recovered.record.utm.utm_source.as_deref(), Some("reddit"));
    assert_eq!(recovered.record.utm.utm_medium.as_deref(), Some("social"));
    assert_eq!(welcome.identity().user_id, website.identity().user_id);
}

#[tokio::test]
async fn at_handoff_e2e_02_cookie_carries_attribution_when_the_query_is_lost() {
    let profile = BrowserProfile::new();
    let visit = PageVisit::parse("https://monkey-block.com/?utm_source=newsletter", None).unwrap();
    let mut website = ContextClient::new(
        ExecutionContextKind::Website,
        profile.page_storage("https://monkey-block.com"),
        profile.cookies(),
    )
    .start(&laptop(), &visit, VISIT_AT)
    .await;
    website.install_click(&InstallClick::new("footer"), &Url::parse(STORE_URL).unwrap(), VISIT_AT);

    let bare = PageVisit::parse("https://welcome.monkey-block.com/", None).unwrap();
    let welcome = ContextClient::new(
        ExecutionContextKind::Welcome,
        profile.page_storage("https://welcome.monkey-block.com"),
        profile.cookies(),
    )
    .start(&laptop(), &bare, VISIT_AT.saturating_add_ms(120_000))
    .await;

    let recovered = welcome.startup().recovered.as_ref().unwrap();
    assert_eq!(recovered.method, RecoveryMethod::Cookie);
    assert_eq!(recovered.corroboration, Corroboration::FingerprintMatch);
    assert_eq!(recovered.record.utm.utm_source.as_deref(), Some("newsletter"));
    assert_eq!(welcome.identity().user_id, website.identity().user_id);
}

#[tokio::test]
async fn at_handoff_e2e_03_welcome_forwards_to_extension_which_reports_the_install() {
    let profile = BrowserProfile::new();
    let visit = PageVisit::parse(
        "https://monkey-block.com/?utm_source=reddit&utm_medium=social&utm_campaign=launch",
        None,
    )
    .unwrap();
    let mut website = ContextClient::new(
        ExecutionContextKind::Website,
        profile.page_storage("https://monkey-block.com"),
        profile.cookies(),
    )
    .start(&laptop(), &visit, VISIT_AT)
    .await;
    let store = website.install_click(&InstallClick::new("hero"), &Url::parse(STORE_URL).unwrap(), VISIT_AT);

    let extension_events = MemoryEventSink::new();
    let analytics = AnalyticsConfig {
        api_key: Some("test-key".to_string()),
        ..AnalyticsConfig::mvp_v1()
    };
    let background = BackgroundContext::start(
        MemoryBackend::acting_as(StorageMedium::ExtensionStorage),
        &laptop(),
        AttributionPolicy::mvp_v1(),
        TransportConfig::mvp_v1(),
        VISIT_AT,
    );
    let background = {
        let client = mb_engines::AnalyticsClient::new(
            &analytics,
            background.identity(),
            ExecutionContextKind::Extension,
            Arc::new(extension_events.clone()),
            DeliveryMode::Blocking,
        );
        background.with_analytics(client)
    };
    assert_eq!(
        background.identity().local_fingerprint,
        website.identity().local_fingerprint,
        "same environment must fingerprint identically in every context"
    );
    let (channel, serving) = background.spawn(8);

    let welcome_visit = PageVisit::parse(carry_query(&store, "https://welcome.monkey-block.com/").as_str(), None).unwrap();
    let welcome = ContextClient::new(
        ExecutionContextKind::Welcome,
        profile.page_storage("https://welcome.monkey-block.com"),
        profile.cookies(),
    )
    .with_channel(channel)
    .start(&laptop(), &welcome_visit, VISIT_AT.saturating_add_ms(60_000))
    .await;
    assert!(welcome.startup().forwarded);
    drop(welcome);

    let mut background = serving.await.unwrap();
    let details = InstallDetails {
        reason: InstallReason::Install,
        version: "3.0.0".to_string(),
    };
    let opened = background
        .on_installed(
            &details,
            &Url::parse("https://welcome.monkey-block.com/").unwrap(),
            VISIT_AT.saturating_add_ms(61_000),
        )
        .unwrap();
    assert_eq!(
        UrlHandoff::from_url(&opened).record.utm.utm_campaign.as_deref(),
        Some("launch")
    );

    // The extension stamps the install date in ISO form; a later page reads it straight
    // off the query.
    let feedback_visit =
        PageVisit::parse(carry_query(&opened, "https://feedback.monkey-block.com/").as_str(), None).unwrap();
    let feedback = ContextClient::new(
        ExecutionContextKind::Feedback,
        profile.page_storage("https://feedback.monkey-block.com"),
        profile.cookies(),
    )
    .start(&laptop(), &feedback_visit, VISIT_AT.saturating_add_ms(120_000))
    .await;
    let resolved = feedback.install_date(VISIT_AT.saturating_add_ms(120_000)).await;
    assert_eq!(resolved.source, InstallDateSource::UrlParameter);
    assert_eq!(resolved.at, VISIT_AT.saturating_add_ms(61_000));

    let recorded = extension_events.events();
    let synced = recorded
        .iter()
        .find(|e| e.event_type == events::ATTRIBUTION_SYNCED)
        .unwrap();
    assert_eq!(synced.event_properties["attribution_source"], "website");
    let installed = recorded
        .iter()
        .find(|e| e.event_type == events::EXTENSION_INSTALLED)
        .unwrap();
    assert_eq!(installed.event_properties["utm_source"], "reddit");
    assert_eq!(installed.event_properties["recovery_method"], "url_parameters_complete");
    assert_eq!(installed.platform.as_deref(), Some("extension"));
}
