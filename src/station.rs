//! # Capture Loop
//!
//! Wires the components into the appliance's single cooperative loop. One
//! call to [`CaptureLoop::run_cycle`] is one serialized cycle:
//!
//! 1. Resolve the run parameters in force (local config overlaid by the
//!    last remote command)
//! 2. Capture a still and derive its brightness
//! 3. Compute the solar day and the cycle's timing facts
//! 4. Classify the scene
//! 5. Plan the composition (with zoom follow) and rasterize it if stale
//! 6. Write the status record and the optional series archive
//! 7. Transfer, then merge the returned remote command
//! 8. Re-evaluate termination and plan the next wait
//!
//! Every step after the capture degrades to a warning on failure. A failed
//! capture re-sends the last good status record with fresh temperatures.

use crate::brightness::{brightness_from_exposure, BrightnessClassifier, Classification};
use crate::camera::Camera;
use crate::composition::{self, PlanInputs, RefreshTriggers, TimingFacts};
use crate::config::{self, PathsConfig, StationProfile};
use crate::ephemeris::{self, SolarDay};
use crate::params::{GeometryParams, ParameterStore, RemoteCommand, RunParameters};
use crate::raster::Rasterizer;
use crate::scheduler::{CaptureScheduler, NextWait, SchedulerState};
use crate::sensors::{SensorBank, Temperatures};
use crate::shutdown::Shutdown;
use crate::status::{SeriesArchive, StatusRecord};
use crate::transfer::{TransferCoordinator, TransferOutcome, Transport};
use crate::SceneState;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Sunset termination; the host should power down.
    PowerDown,
    /// Operator interrupt.
    Interrupted,
    /// Single-cycle mode finished.
    Completed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_warmup: bool,
    pub once: bool,
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub capture_at: DateTime<Utc>,
    pub run: RunParameters,
    /// `None` when the capture failed
    pub classification: Option<Classification>,
    pub rendered: bool,
    pub transfer: TransferOutcome,
    pub remote_applied: bool,
    pub terminating: bool,
    pub next: NextWait,
    /// Recovered failures, in order
    pub errors: Vec<String>,
}

pub struct CaptureLoop<C: Camera, R: Rasterizer, T: Transport> {
    camera: C,
    rasterizer: R,
    coordinator: TransferCoordinator<T>,
    store: ParameterStore,
    classifier: BrightnessClassifier,
    scheduler: CaptureScheduler,
    sensors: SensorBank,
    profile: StationProfile,
    archive: SeriesArchive,
    paths: PathsConfig,
    last_offline: Option<bool>,
    /// The collector has no pair for the current scene yet.
    unpublished: bool,
    last_status: Option<StatusRecord>,
}

impl<C: Camera, R: Rasterizer, T: Transport> CaptureLoop<C, R, T> {
    /// When remote control is on, the cached remote command is restored so a
    /// restart keeps the collector's overrides.
    pub fn new(
        mut store: ParameterStore,
        camera: C,
        rasterizer: R,
        coordinator: TransferCoordinator<T>,
        sensors: SensorBank,
        profile: StationProfile,
    ) -> Self {
        restore_remote(&mut store);
        let config = store.config();
        let paths = config.paths.clone();
        CaptureLoop {
            classifier: BrightnessClassifier::new(config.classifier),
            scheduler: CaptureScheduler::new(config.schedule.clone()),
            archive: SeriesArchive::new(&paths.archive_dir),
            paths,
            camera,
            rasterizer,
            coordinator,
            store,
            sensors,
            profile,
            last_offline: None,
            unpublished: true,
            last_status: None,
        }
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn coordinator(&self) -> &TransferCoordinator<T> {
        &self.coordinator
    }

    pub fn scene(&self) -> SceneState {
        self.classifier.state()
    }

    /// Run until sunset termination or interrupt, then release the devices.
    pub async fn run(&mut self, mut shutdown: Shutdown, options: RunOptions) -> Exit {
        let exit = self.run_until_exit(&mut shutdown, options).await;
        info!("Loop ended ({:?}), closing devices", exit);
        self.camera.close().await;
        self.coordinator.close().await;
        exit
    }

    async fn run_until_exit(&mut self, shutdown: &mut Shutdown, options: RunOptions) -> Exit {
        if !options.skip_warmup {
            let warmup = self.scheduler.warmup();
            info!("Warming up for {:?}", warmup);
            if !shutdown.sleep(warmup).await {
                return Exit::Interrupted;
            }
        }
        self.scheduler.start_capturing();

        loop {
            let align = self.scheduler.alignment_wait(Utc::now());
            debug!("Aligning for {:?}", align);
            if !shutdown.sleep(align).await {
                return Exit::Interrupted;
            }
            if shutdown.is_requested() {
                return Exit::Interrupted;
            }

            let report = self.run_cycle().await;
            if options.once {
                return Exit::Completed;
            }
            if report.terminating {
                return Exit::PowerDown;
            }
            if !shutdown.sleep(report.next.sleep).await {
                return Exit::Interrupted;
            }
        }
    }

    /// One complete cycle. Never fails; recovered errors are listed in the
    /// report.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let mut errors = Vec::new();
        let run = self.store.effective();
        info!(
            "Capture (period {} min, offline {}, series {})",
            run.period_m, run.cam_offline, run.series
        );

        let (capture_at, classification, rendered, status) = match self.camera.capture().await {
            Ok(frame) => {
                let brightness = brightness_from_exposure(
                    frame.exposure_us,
                    frame.analog_gain,
                    frame.digital_gain,
                );
                let solar = self.solar_day(frame.captured_at);
                let timing = TimingFacts::new(frame.captured_at, &solar);
                let classification = self.classifier.update(brightness);
                match classification.transitioned_to {
                    Some(state) => info!(
                        "Scene {} -> {} (brightness {})",
                        classification.previous, state, brightness
                    ),
                    None => info!("Scene {} (brightness {})", classification.state, brightness),
                }

                let temperatures = self.sensors.read_all();
                let rendered = self.compose(
                    &run,
                    &classification,
                    &solar,
                    &timing,
                    &temperatures,
                    &frame.image_path,
                    &mut errors,
                );

                let status =
                    StatusRecord::new(&timing, &temperatures, brightness, classification.state);
                self.last_status = Some(status.clone());
                if run.series {
                    let image = (classification.state.is_lit() && rendered)
                        .then_some(self.paths.total_image.as_path());
                    if let Err(e) =
                        self.archive
                            .record(frame.captured_at, &temperatures, brightness, image)
                    {
                        warn!("Series archive: {}", e);
                        errors.push(format!("series archive: {}", e));
                    }
                }
                (frame.captured_at, Some(classification), rendered, status)
            }
            Err(e) => {
                warn!("Capture failed: {}", e);
                errors.push(format!("capture: {}", e));
                let mut status = self
                    .last_status
                    .clone()
                    .unwrap_or_else(StatusRecord::startup);
                status.update_temperatures(&self.sensors.read_all());
                (Utc::now(), None, false, status)
            }
        };

        if let Err(e) = status.write(&self.paths.status) {
            warn!("Cannot write status: {}", e);
            errors.push(format!("status: {}", e));
        }

        let transfer = self.coordinator.run_cycle(&status).await;
        let remote_applied = self.apply_remote(transfer.command, &mut errors);

        let solar = self.solar_day(capture_at);
        let scene = self.classifier.state();
        let boundary_pending = scene == SceneState::Night && self.coordinator.images_pending();
        let terminating = classification.is_some()
            && self.scheduler.check_termination(capture_at, &solar, scene, boundary_pending);

        let elapsed = chrono::Duration::from_std(started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = capture_at + elapsed;
        let period_m = self.store.effective().period_m;
        let next = self.scheduler.plan_next(capture_at, now, period_m, &solar);
        self.scheduler.record_cycle(started.elapsed());
        if terminating {
            info!("Terminating after {} cycles", self.scheduler.metrics().cycles);
        }

        CycleReport {
            capture_at,
            run,
            classification,
            rendered,
            transfer,
            remote_applied,
            terminating,
            next,
            errors,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    // -- Private Implementation --

    fn solar_day(&self, at: DateTime<Utc>) -> SolarDay {
        ephemeris::compute_with_horizon(
            at,
            self.profile.longitude,
            self.profile.latitude,
            self.store.config().schedule.horizon,
        )
    }

    /// Plan and, when stale, rasterize the image pair. Returns whether new
    /// images were written.
    fn compose(
        &mut self,
        run: &RunParameters,
        classification: &Classification,
        solar: &SolarDay,
        timing: &TimingFacts,
        temperatures: &Temperatures,
        live: &Path,
        errors: &mut Vec<String>,
    ) -> bool {
        let config = self.store.config();
        let sensor = self.camera.resolution();
        let mut settings = self.store.geometry();
        if run.zoom_move {
            settings = settings.follow_shadow(
                &config.dial,
                sensor,
                timing.apparent_hour(),
                solar.declination_deg,
            );
        }
        let geometry = GeometryParams::derive(&settings, sensor);

        let offline_changed = self
            .last_offline
            .map_or(run.cam_offline, |previous| previous != run.cam_offline);
        self.last_offline = Some(run.cam_offline);

        let plan = composition::plan(PlanInputs {
            geometry: &geometry,
            scene: classification.state,
            timing,
            run,
            temperatures,
            station_name: &self.profile.name,
            brand: &config.overlay.brand,
            blur: config
                .operational
                .blur
                .then_some(self.paths.mask_image.as_path()),
            triggers: RefreshTriggers {
                scene_changed: classification.transitioned_to.is_some() || self.unpublished,
                dark_boundary: classification.dark_boundary,
                offline_changed,
            },
        });
        if !plan.needs_render() {
            debug!("Published images are current, nothing to render");
            return false;
        }

        match self.rasterizer.render(&plan, live) {
            Ok(()) => {
                if plan.publish {
                    self.coordinator.mark_images(plan.refresh_total, plan.refresh_detail);
                    self.unpublished = false;
                }
                true
            }
            Err(e) => {
                warn!("Render failed: {}", e);
                errors.push(format!("render: {}", e));
                self.unpublished |= plan.publish;
                false
            }
        }
    }

    fn apply_remote(&mut self, command: Option<RemoteCommand>, errors: &mut Vec<String>) -> bool {
        let applied = match self.store.apply_cycle(command) {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Cannot persist parameters: {}", e);
                errors.push(format!("parameters: {}", e));
                false
            }
        };
        if let (true, Some(cmd)) = (applied, command) {
            if let Err(e) = config::save_remote_command(&self.paths.remote_cmd, &cmd) {
                warn!("Cannot cache remote command: {}", e);
                errors.push(format!("remote command cache: {}", e));
            }
        }
        applied
    }
}

fn restore_remote(store: &mut ParameterStore) {
    if !store.config().operational.remote_cmd {
        return;
    }
    let path = store.config().paths.remote_cmd.clone();
    if !path.exists() {
        return;
    }
    match config::load_remote_command(&path) {
        Ok(cmd) => {
            info!("Restoring cached remote command from {}", path.display());
            store.accept_remote(cmd);
        }
        Err(e) => warn!("Ignoring cached remote command {}: {}", path.display(), e),
    }
}
