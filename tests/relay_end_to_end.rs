use streamrelay_server::models::{PlatformId, RelayConfig, Settings};
use streamrelay_server::services::{compile, render, ConfigError, PlatformCatalog, RenderOptions};

#[test]
fn twitch_only_relay_renders_one_application() {
    let config = RelayConfig {
        port: 1935,
        bitrate_kbps: 6000,
        ..RelayConfig::default()
    }
    .with_destination(PlatformId::Twitch, "abc");

    let topology = compile(&config).unwrap();
    assert_eq!(topology.pipelines.len(), 1);

    let pipeline = &topology.pipelines[0];
    assert_eq!(pipeline.platform, PlatformId::Twitch);
    assert_eq!(pipeline.video_bitrate_kbps, 6000);
    assert!(pipeline.destination_url().ends_with("/abc"));

    let text = render(&topology);
    assert!(text.contains("listen 1935;"));
    assert_eq!(text.matches("application twitch").count(), 1);
    assert!(!text.contains("application youtube"));
    assert!(text.contains("-f flv rtmp://live.twitch.tv/app/abc;"));
}

#[test]
fn saved_settings_drive_the_topology() {
    let settings: Settings = serde_json::from_str(
        r#"{
            "twitch": {"enabled": true, "key": "tw"},
            "youtube": {"enabled": true, "key": "yt"},
            "kick": {"enabled": true, "key": "kk"},
            "general": {"port": 1940},
            "quality": {"preset": "Medium", "bitrate": 6000}
        }"#,
    )
    .unwrap();

    let topology = compile(&settings.to_relay_config()).unwrap();
    let bitrates: Vec<(PlatformId, u32)> = topology
        .pipelines
        .iter()
        .map(|p| (p.platform, p.video_bitrate_kbps))
        .collect();
    assert_eq!(
        bitrates,
        vec![
            (PlatformId::Twitch, 6000),
            (PlatformId::Youtube, 12000),
            (PlatformId::Kick, 10000),
        ]
    );

    let text = render(&topology);
    assert!(text.contains("listen 1940;"));
    assert!(text.contains("push rtmp://localhost:1940/kick;"));
    assert!(text.contains("-preset medium"));
}

#[test]
fn disabled_settings_are_rejected_before_rendering() {
    let err = compile(&Settings::default().to_relay_config()).unwrap_err();
    assert_eq!(err, ConfigError::NoPlatformsEnabled);
}

#[test]
fn overridden_catalog_changes_scaling() {
    let catalog = PlatformCatalog::with_overrides_json(
        r#"{"platforms":[{"id":"youtube","scaling":{"rule":"offset","value":1000}}]}"#,
    )
    .unwrap();
    let config = RelayConfig::default().with_destination(PlatformId::Youtube, "yt");

    let topology = streamrelay_server::services::compile_with(&catalog, &config).unwrap();
    assert_eq!(topology.pipelines[0].video_bitrate_kbps, 7000);

    let preview = streamrelay_server::services::render_with(&topology, &RenderOptions::default().redacted());
    assert!(preview.contains("rtmp://a.rtmp.youtube.com/live2/***;"));
}

#[cfg(unix)]
mod supervised {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;

    use streamrelay_server::models::{LifecycleState, PlatformId, RelayConfig};
    use streamrelay_server::services::{
        ControllerOptions, NoopEventSink, PlatformCatalog, RelayController,
    };

    #[tokio::test]
    async fn relay_lifecycle_through_the_controller() {
        let temp = tempfile::tempdir().unwrap();
        let binary = temp.path().join("nginx");
        std::fs::write(&binary, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut options = ControllerOptions::new(temp.path().join("conf"), binary);
        options.startup_timeout = Duration::from_millis(200);
        let controller = RelayController::new(PlatformCatalog::builtin(), options, Arc::new(NoopEventSink));

        let session = controller
            .start(RelayConfig::default().with_destination(PlatformId::Twitch, "abc"))
            .await
            .unwrap();
        assert_eq!(session.publish_url, "rtmp://localhost:1935/live");
        assert_eq!(controller.status().state, LifecycleState::Running);

        let conf = std::fs::read_to_string(temp.path().join("conf").join("nginx.conf")).unwrap();
        assert!(conf.contains("listen 1935;"));

        controller.stop().await;
        assert_eq!(controller.status().state, LifecycleState::Stopped);
    }
}
