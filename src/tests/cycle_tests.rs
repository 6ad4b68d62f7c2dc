use super::fakes::*;
use std::fs;
use sundial_cam_lib::{
    composition::SourceImage,
    config::{self, Config},
    params::RemoteCommand,
    scheduler::SchedulerState,
    shutdown::Shutdown,
    station::{Exit, RunOptions},
    status::StatusRecord,
    transfer::TransferError,
    SceneState,
};
use tempfile::tempdir;

fn offline_command() -> RemoteCommand {
    RemoteCommand {
        cam_offline: true,
        period_m: 5,
        zoom_draw_rect: true,
        zoom_center_perc_x: 10,
        ..RemoteCommand::default()
    }
}

/// A sunny morning followed by the first dark frame after sunset: the
/// night placeholder goes out once and the day ends.
#[tokio::test]
async fn dark_boundary_is_uploaded_once_then_the_day_ends() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![(equinox(10, 0), SUNNY_US), (equinox(19, 0), NIGHT_US)],
        ScriptedTransport::default(),
        |_| {},
    );

    let day = h.station.run_cycle().await;
    assert_eq!(day.classification.unwrap().state, SceneState::Sunny);
    assert!(day.rendered);
    assert!(day.transfer.delivered);
    assert!(day.transfer.plan.info && day.transfer.plan.total && day.transfer.plan.detail);
    assert!(!day.terminating);
    assert_eq!(h.station.state(), SchedulerState::Capturing);
    assert_eq!(day.next.period_secs, 60);

    let night = h.station.run_cycle().await;
    let c = night.classification.unwrap();
    assert_eq!(c.state, SceneState::Night);
    assert!(c.dark_boundary);
    assert!(night.rendered);
    assert!(night.transfer.plan.total && night.transfer.plan.detail);
    assert!(!night.transfer.plan.info);
    assert!(night.terminating);
    assert_eq!(h.station.state(), SchedulerState::Terminating);

    let plans = h.plans.borrow();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].source, SourceImage::Live);
    assert_eq!(plans[1].source, SourceImage::CloudyNight);

    let batches = &h.station.coordinator().transport().batches;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].total.as_deref(), Some(&b"total 1"[..]));
    assert_eq!(batches[1].status.dial.night, 1);
    assert_eq!(batches[1].status.dial.sunny, 0);
}

/// Two sunny minutes in a row: the second frame is rendered locally but the
/// collector only gets the status.
#[tokio::test]
async fn steady_sunny_cycle_sends_only_status() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![(equinox(9, 0), SUNNY_US), (equinox(9, 1), SUNNY_US)],
        ScriptedTransport::default(),
        |_| {},
    );

    let first = h.station.run_cycle().await;
    assert!(first.transfer.plan.total && first.transfer.plan.detail);

    let second = h.station.run_cycle().await;
    assert_eq!(second.classification.unwrap().transitioned_to, None);
    assert!(second.rendered);
    assert!(!second.transfer.plan.includes_images());
    assert!(second.transfer.plan.status);
    assert!(!h.plans.borrow()[1].publish);

    let batches = &h.station.coordinator().transport().batches;
    assert_eq!(batches.len(), 2);
    assert!(batches[1].total.is_none() && batches[1].detail.is_none());
    assert_eq!(batches[1].status.dial.sunny, 1);
}

#[tokio::test]
async fn images_go_out_on_the_cloudy_to_sunny_transition() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![
            (equinox(9, 0), CLOUDY_US),
            (equinox(9, 1), CLOUDY_US),
            (equinox(9, 2), SUNNY_US),
            (equinox(9, 3), SUNNY_US),
        ],
        ScriptedTransport::default(),
        |_| {},
    );

    let mut sent = Vec::new();
    for _ in 0..4 {
        let report = h.station.run_cycle().await;
        sent.push(report.transfer.plan.includes_images());
    }
    // first pair of the run, then only the change of scene
    assert_eq!(sent, [true, false, true, false]);
    assert_eq!(h.station.scene(), SceneState::Sunny);

    let batches = &h.station.coordinator().transport().batches;
    assert_eq!(batches[2].total.as_deref(), Some(&b"total 2"[..]));
}

#[tokio::test]
async fn failed_boundary_upload_postpones_termination() {
    let dir = tempdir().unwrap();
    let mut transport = ScriptedTransport::default();
    transport.replies.push_back(Ok(None));
    transport
        .replies
        .push_back(Err(TransferError::Connect("refused".to_string())));
    let mut h = harness(
        dir.path(),
        vec![
            (equinox(10, 0), SUNNY_US),
            (equinox(19, 0), NIGHT_US),
            (equinox(19, 1), NIGHT_US),
        ],
        transport,
        |_| {},
    );

    h.station.run_cycle().await;
    let failed = h.station.run_cycle().await;
    assert!(!failed.transfer.delivered);
    assert!(!failed.terminating);
    assert!(h.station.coordinator().images_pending());

    let retried = h.station.run_cycle().await;
    // nothing new to draw, the stored placeholder is resent
    assert!(!retried.rendered);
    assert_eq!(h.plans.borrow().len(), 2);
    assert!(retried.transfer.plan.total);
    assert!(retried.transfer.delivered);
    assert!(retried.terminating);
}

#[tokio::test]
async fn dark_afternoon_waits_for_sunset() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![
            (equinox(13, 0), CLOUDY_US),
            (equinox(15, 0), NIGHT_US),
            (equinox(15, 1), NIGHT_US),
            (equinox(17, 30), NIGHT_US),
        ],
        ScriptedTransport::default(),
        |_| {},
    );

    let cloudy = h.station.run_cycle().await;
    assert_eq!(cloudy.classification.unwrap().state, SceneState::Cloudy);

    let storm = h.station.run_cycle().await;
    assert!(storm.classification.unwrap().dark_boundary);
    assert!(!storm.terminating);

    let still_dark = h.station.run_cycle().await;
    assert!(!still_dark.rendered);
    assert!(!still_dark.transfer.plan.includes_images());
    assert!(!still_dark.terminating);

    let evening = h.station.run_cycle().await;
    assert!(evening.terminating);
    assert_eq!(h.plans.borrow().len(), 2);
}

#[tokio::test]
async fn remote_command_is_ignored_without_remote_control() {
    let dir = tempdir().unwrap();
    let mut transport = ScriptedTransport::default();
    transport.replies.push_back(Ok(Some(offline_command())));
    let mut h = harness(
        dir.path(),
        vec![(equinox(10, 0), SUNNY_US), (equinox(10, 1), SUNNY_US)],
        transport,
        |_| {},
    );

    let first = h.station.run_cycle().await;
    assert!(first.transfer.command.is_some());
    assert!(!first.remote_applied);
    assert_eq!(h.station.store().effective().period_m, 1);
    assert!(!h.remote_cmd_path.exists());

    h.station.run_cycle().await;
    assert_eq!(h.plans.borrow()[1].source, SourceImage::Live);
}

#[tokio::test]
async fn remote_command_takes_over_when_enabled() {
    let dir = tempdir().unwrap();
    let mut transport = ScriptedTransport::default();
    transport.replies.push_back(Ok(Some(offline_command())));
    let mut h = harness(
        dir.path(),
        vec![(equinox(8, 0), SUNNY_US), (equinox(8, 5), SUNNY_US), (equinox(8, 10), SUNNY_US)],
        transport,
        |c| c.operational.remote_cmd = true,
    );

    let first = h.station.run_cycle().await;
    assert!(first.remote_applied);
    assert_eq!(first.next.period_secs, 300);
    let effective = h.station.store().effective();
    assert!(effective.cam_offline);
    assert_eq!(effective.period_m, 5);

    // period and zoom centre are persisted, the flags are cached
    let on_disk = Config::load_from_path(&h.config_path);
    assert_eq!(on_disk.operational.period_m, 5);
    assert_eq!(on_disk.geometry.zoom_center_perc_x, 10);
    let cached = config::parse_remote_command(&fs::read(&h.remote_cmd_path).unwrap()).unwrap();
    assert_eq!(cached, offline_command());

    let offline = h.station.run_cycle().await;
    assert!(offline.run.cam_offline);
    assert_eq!(h.plans.borrow()[1].source, SourceImage::Offline);
    assert!(offline.transfer.plan.total);

    // the placeholder does not change while the override holds
    let steady = h.station.run_cycle().await;
    assert!(!steady.rendered);
    assert_eq!(h.plans.borrow().len(), 2);
}

#[tokio::test]
async fn capture_failure_still_reports_status() {
    let dir = tempdir().unwrap();
    let mut h = harness(dir.path(), Vec::new(), ScriptedTransport::default(), |_| {});

    let report = h.station.run_cycle().await;
    assert!(report.classification.is_none());
    assert!(report.errors.iter().any(|e| e.starts_with("capture")));
    assert!(!report.rendered);
    assert!(report.transfer.delivered);
    assert!(!report.terminating);

    let on_disk: StatusRecord = config::read_toml(&dir.path().join("status.toml")).unwrap();
    assert_eq!(on_disk.system.capture_time, "");
    assert_eq!(on_disk.system.cpu_temperature, "48.3");
    assert_eq!(on_disk.system.outcase_temperature, "12.5");
    assert_eq!(h.station.coordinator().transport().batches.len(), 1);
}

#[tokio::test]
async fn capture_failure_keeps_the_last_good_status() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![(equinox(9, 0), SUNNY_US)],
        ScriptedTransport::default(),
        |_| {},
    );
    let status_path = dir.path().join("status.toml");

    h.station.run_cycle().await;
    let good: StatusRecord = config::read_toml(&status_path).unwrap();
    assert_eq!(good.system.capture_time, "UTC: 20 Mar 2026 09:00:00");

    let failed = h.station.run_cycle().await;
    assert!(failed.classification.is_none());

    let kept: StatusRecord = config::read_toml(&status_path).unwrap();
    assert_eq!(kept, good);
    assert_eq!(kept.dial.sunny, 1);
    assert_eq!(kept.system.camera_temperature, "20.0");

    let batches = &h.station.coordinator().transport().batches;
    assert_eq!(batches[1].status, good);
}

#[tokio::test]
async fn cached_remote_command_survives_a_restart() {
    let dir = tempdir().unwrap();
    config::save_remote_command(dir.path().join("remotecmd.toml"), &offline_command()).unwrap();
    let h = harness(
        dir.path(),
        Vec::new(),
        ScriptedTransport::default(),
        |c| c.operational.remote_cmd = true,
    );

    let effective = h.station.store().effective();
    assert!(effective.cam_offline);
    assert_eq!(effective.period_m, 5);
    assert_eq!(h.station.store().remote(), Some(&offline_command()));
}

#[tokio::test]
async fn cached_remote_command_is_ignored_without_remote_control() {
    let dir = tempdir().unwrap();
    config::save_remote_command(dir.path().join("remotecmd.toml"), &offline_command()).unwrap();
    let h = harness(dir.path(), Vec::new(), ScriptedTransport::default(), |_| {});

    assert!(h.station.store().remote().is_none());
    assert!(!h.station.store().effective().cam_offline);
}

#[tokio::test]
async fn series_archive_records_lit_cycles() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![(equinox(10, 0), SUNNY_US), (equinox(19, 0), NIGHT_US)],
        ScriptedTransport::default(),
        |c| c.operational.series = true,
    );

    h.station.run_cycle().await;
    h.station.run_cycle().await;

    let archive = dir.path().join("archive");
    let log = fs::read_to_string(archive.join("status2026.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "2026-03-20T10:00:00Z;48.3;20.0;12.5;990099");
    assert!(archive.join("images079/img079100000.jpg").exists());
    // no night frame in the image series
    assert!(!archive.join("images079/img079190000.jpg").exists());
}

#[tokio::test]
async fn interrupt_before_warmup_closes_the_camera() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![(equinox(10, 0), SUNNY_US)],
        ScriptedTransport::default(),
        |_| {},
    );
    let (trigger, shutdown) = Shutdown::new();
    trigger.trigger();

    let exit = h.station.run(shutdown, RunOptions::default()).await;
    assert_eq!(exit, Exit::Interrupted);
    assert!(h.camera_closed.get());
    assert!(h.station.coordinator().transport().batches.is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_cycle_mode_runs_once_after_warmup() {
    let dir = tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        vec![(equinox(10, 0), SUNNY_US), (equinox(10, 1), SUNNY_US)],
        ScriptedTransport::default(),
        |_| {},
    );
    let (_trigger, shutdown) = Shutdown::new();

    let exit = h
        .station
        .run(
            shutdown,
            RunOptions {
                skip_warmup: false,
                once: true,
            },
        )
        .await;
    assert_eq!(exit, Exit::Completed);
    assert_eq!(h.station.coordinator().transport().batches.len(), 1);
    assert!(h.camera_closed.get());
}
