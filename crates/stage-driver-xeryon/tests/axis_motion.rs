//! Move requests, clamping, arrival and derived telemetry on a mock link.

mod common;

use approx::assert_relative_eq;
use common::{linear_config, open, set_limits, wait_for};
use stage_core::dispatch::QueueDispatcher;
use stage_core::error::StageError;
use stage_core::mock_serial;
use stage_driver_xeryon::telegram::TelemetryFrame;
use stage_driver_xeryon::{Controller, ControllerConfig, TimeBase, Unit};
use std::sync::Arc;
use std::time::Duration;

const POSITION_REACHED: u32 = 1 << 10;
const MOTOR_ON: u32 = 1 << 5;
const ENCODER_ERROR: u32 = 1 << 12;

#[tokio::test]
async fn move_resolves_when_position_reached() {
    let (controller, mut device) = open(linear_config(1.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(5_000_000).await });

    device.expect_line("DPOS=5000000").await;
    assert_eq!(axis.dpos(), 5_000_000);
    assert!(axis.is_awaiting_arrival());

    device
        .send_str(&format!("STAT={} EPOS=5000000\n", POSITION_REACHED))
        .unwrap();

    let report = request.await.unwrap().unwrap();
    assert_eq!(report.target, 5_000_000);
    assert!(report.delay >= Duration::ZERO);
    assert!(!axis.is_awaiting_arrival());

    let snap = axis.snapshot();
    assert!(snap.position_reached);
    assert_eq!(snap.command_to_position_reached_delay, Some(report.delay));
}

#[tokio::test]
async fn target_beyond_high_limit_is_clamped() {
    let (controller, mut device) = open(linear_config(1.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(20_000_000).await });
    device.expect_line("DPOS=10000000").await;
    assert_eq!(axis.dpos(), 10_000_000);

    axis.stop().await.unwrap();
    device.expect_line("STOP").await;
    assert!(matches!(
        request.await.unwrap(),
        Err(StageError::Cancelled { target: 10_000_000 })
    ));
}

#[tokio::test]
async fn clamp_uses_resolution() {
    // 10 mm at 1000 nm/count is 10000 counts
    let (controller, mut device) = open(linear_config(1000.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(5_000_000).await });
    device.expect_line("DPOS=10000").await;
    axis.stop().await.unwrap();
    assert!(request.await.unwrap().is_err());

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(-400).await });
    device.expect_line_eventually("DPOS=0").await;
    // EPOS is still 0, so the request completes at once
    assert_eq!(request.await.unwrap().unwrap().delay, Duration::ZERO);
}

#[tokio::test]
async fn rotary_target_is_normalised() {
    let mut config: ControllerConfig = toml::from_str(
        r#"
        name = "rot"
        port = "/dev/mock0"
        controller_type = "c"
        load_parameters_on_open = false

        [[axes]]
        model = "XRT1"
        resolution = 109.0
        counts_per_revolution = 360
        "#,
    )
    .unwrap();
    config.arrival_timeout_ms = 2000;
    let (controller, mut device) = open(config).await;
    let axis = controller.axis(None).unwrap();

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(-50).await });
    device.expect_line("DPOS=310").await;
    assert_eq!(axis.dpos(), 310);

    // -52 is two counts from 310 one revolution down
    device
        .send_str(&format!("STAT={} EPOS=-52\n", POSITION_REACHED))
        .unwrap();
    let report = request.await.unwrap().unwrap();
    assert_eq!(report.target, 310);
}

#[tokio::test]
async fn newer_request_supersedes_older() {
    let (controller, mut device) = open(linear_config(1.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);

    let first_axis = axis.clone();
    let first = tokio::spawn(async move { first_axis.set_dpos(1000).await });
    device.expect_line("DPOS=1000").await;

    let second_axis = axis.clone();
    let second = tokio::spawn(async move { second_axis.set_dpos(2000).await });
    device.expect_line("DPOS=2000").await;

    assert!(matches!(
        first.await.unwrap(),
        Err(StageError::Superseded { target: 1000 })
    ));

    device
        .send_str(&format!("STAT={} EPOS=2003\n", POSITION_REACHED))
        .unwrap();
    assert_eq!(second.await.unwrap().unwrap().target, 2000);
}

#[tokio::test]
async fn move_times_out_without_arrival() {
    let mut config = linear_config(1.0);
    config.arrival_timeout_ms = 50;
    let (controller, mut device) = open(config).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);

    let result = axis.set_dpos(3000).await;
    device.expect_line("DPOS=3000").await;
    assert!(matches!(result, Err(StageError::Timeout(_))));
    assert!(!axis.is_awaiting_arrival());
}

#[tokio::test]
async fn position_reached_is_gated_by_tolerance() {
    let (controller, mut device) = open(linear_config(1.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);
    axis.parameters().require("PTO2").unwrap().set(4.0).unwrap();

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(100).await });
    device.expect_line("DPOS=100").await;

    // Bit set but 10 counts away: not reached
    device
        .send_str(&format!("STAT={} EPOS=90\n", POSITION_REACHED))
        .unwrap();
    let snap = wait_for(&axis, |s| s.epos == 90).await;
    assert!(snap.flags.position_reached);
    assert!(!snap.position_reached);
    assert!(snap.awaiting_arrival);

    // Within PTO2 + 1
    device
        .send_str(&format!("STAT={} EPOS=95\n", POSITION_REACHED))
        .unwrap();
    assert!(request.await.unwrap().is_ok());
}

#[tokio::test]
async fn close_cancels_pending_move() {
    let (controller, mut device) = open(linear_config(1.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, 0.0, 10.0);

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(4000).await });
    device.expect_line("DPOS=4000").await;

    controller.close().await.unwrap();
    assert!(matches!(
        request.await.unwrap(),
        Err(StageError::Cancelled { .. })
    ));
}

#[tokio::test]
async fn step_starts_from_encoder_when_not_reached() {
    let mut config = linear_config(1000.0);
    config.axes[0].step_size = 0.5;
    let (controller, mut device) = open(config).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, -10.0, 10.0);

    device.send_str("EPOS=2000\n").unwrap();
    wait_for(&axis, |s| s.epos == 2000).await;

    // DPOS 0 vs EPOS 2000: step from EPOS, 0.5 mm = 500 counts
    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.step_positive().await });
    device.expect_line("DPOS=2500").await;
    axis.stop().await.unwrap();
    assert!(request.await.unwrap().is_err());

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.take_step(-1.0, Unit::Mm).await });
    device.expect_line_eventually("DPOS=1000").await;
    axis.stop().await.unwrap();
    assert!(request.await.unwrap().is_err());
}

#[tokio::test]
async fn jog_commands_snap_slider_to_limits() {
    let (controller, mut device) = open(linear_config(1000.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, -5.0, 7.0);

    axis.move_positive().await.unwrap();
    device.expect_line("MOVE=1").await;
    assert_relative_eq!(axis.snapshot().slider, 7.0);

    axis.scan_negative().await.unwrap();
    device.expect_line("SCAN=-1").await;
    assert_relative_eq!(axis.snapshot().slider, -5.0);

    axis.index_plus().await.unwrap();
    device.expect_line("INDX=1").await;
    axis.index_minus().await.unwrap();
    device.expect_line("INDX=0").await;
    axis.index().await.unwrap();
    device.expect_line("INDX=0").await;
    axis.reset().await.unwrap();
    device.expect_line("RSET").await;
}

#[tokio::test]
async fn speed_is_non_negative_magnitude() {
    let (opener, _device) = mock_serial::opener();
    let controller = Controller::with_opener(linear_config(1000.0), Arc::new(opener)).unwrap();
    let axis = controller.axis(None).unwrap();

    let frame = |epos, time| TelemetryFrame {
        stat: Some(MOTOR_ON),
        epos: Some(epos),
        time: Some(time),
    };
    axis.apply_frame(&frame(0, 100), 0.0);
    // 1000 counts at 1000 nm/count over 500 ticks of 1 ms
    axis.apply_frame(&frame(1000, 600), 0.0);
    assert_relative_eq!(axis.speed(), 2.0, epsilon = 1e-9);

    axis.apply_frame(&frame(0, 1100), 0.0);
    assert_relative_eq!(axis.speed(), 2.0, epsilon = 1e-9);
    assert_relative_eq!(axis.max_speed(), 2.0, epsilon = 1e-9);
    assert_relative_eq!(axis.speed_in(Unit::Mu).unwrap(), 2000.0, epsilon = 1e-6);

    axis.reset_max_speed();
    assert_eq!(axis.max_speed(), 0.0);

    // Motor off reports zero
    axis.apply_frame(
        &TelemetryFrame {
            stat: Some(0),
            epos: Some(500),
            time: Some(1600),
        },
        0.0,
    );
    assert_eq!(axis.speed(), 0.0);
}

#[tokio::test]
async fn controller_clock_time_base() {
    let (opener, _device) = mock_serial::opener();
    let controller = Controller::with_opener(linear_config(1000.0), Arc::new(opener)).unwrap();
    let axis = controller.axis(None).unwrap();
    axis.set_time_base(TimeBase::ControllerClock);

    let frame = |epos| TelemetryFrame {
        stat: Some(MOTOR_ON),
        epos: Some(epos),
        time: Some(5),
    };
    axis.apply_frame(&frame(0), 1.0);
    axis.apply_frame(&frame(-4000), 3.0);
    assert_relative_eq!(axis.speed(), 2.0, epsilon = 1e-9);
}

#[tokio::test]
async fn plot_samples_and_bounds() {
    let mut config = linear_config(1000.0);
    config.telemetry.plot_capacity = 3;
    let (opener, _device) = mock_serial::opener();
    let controller = Controller::with_opener(config, Arc::new(opener)).unwrap();
    let axis = controller.axis(None).unwrap();

    axis.apply_frame(&TelemetryFrame { epos: Some(7), ..Default::default() }, 0.0);
    assert!(axis.drain_plot_samples().is_empty());

    axis.start_logging();
    for (i, epos) in [1000, 3000, -2000, 500].into_iter().enumerate() {
        axis.apply_frame(
            &TelemetryFrame {
                epos: Some(epos),
                time: Some(i as u16 * 100),
                ..Default::default()
            },
            0.0,
        );
    }
    axis.stop_logging();

    let samples = axis.drain_plot_samples();
    assert_eq!(samples.len(), 3);
    assert_relative_eq!(samples[0].position, 3.0);
    assert_relative_eq!(samples[2].seconds, 0.3, epsilon = 1e-9);
    assert_eq!(axis.position_bounds(), Some((-2000, 3000)));
}

#[tokio::test]
async fn encoder_error_suppressed_after_reset() {
    let (controller, mut device) = open(linear_config(312.5)).await;
    let axis = controller.axis(None).unwrap();
    axis.parameters().require("POLI").unwrap().set(1.0).unwrap();

    axis.reset_encoder().await.unwrap();
    device.expect_line("ENCR").await;

    let error = TelemetryFrame {
        stat: Some(ENCODER_ERROR),
        ..Default::default()
    };
    axis.apply_frame(&error, 0.0);
    assert!(!axis.flags().encoder_error);
    assert!(axis.info_messages().is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    axis.apply_frame(&error, 0.0);
    assert!(axis.flags().encoder_error);
    assert_eq!(axis.info_messages()[0].title, "Encoder error");
}

#[tokio::test]
async fn queued_dispatcher_defers_snapshots() {
    let (opener, _device) = mock_serial::opener();
    let (dispatcher, mut queue) = QueueDispatcher::new();
    let controller =
        Controller::with_parts(linear_config(1000.0), Arc::new(opener), Arc::new(dispatcher))
            .unwrap();
    let axis = controller.axis(None).unwrap();

    axis.apply_frame(&TelemetryFrame { epos: Some(42), ..Default::default() }, 0.0);
    assert_eq!(axis.epos(), 42);
    assert_eq!(axis.snapshot().epos, 0);

    assert_eq!(queue.run_pending(), 1);
    assert_eq!(axis.snapshot().epos, 42);
}

#[tokio::test]
async fn model_change_rebuilds_parameters() {
    let (opener, _device) = mock_serial::opener();
    let controller = Controller::with_opener(linear_config(312.5), Arc::new(opener)).unwrap();
    let axis = controller.axis(None).unwrap();
    // Kept locally even though the closed link refuses to send it
    assert!(matches!(
        axis.set_parameter("SSPD", 12.5).await,
        Err(StageError::NotConnected(_))
    ));
    assert_eq!(axis.parameters().value("SSPD"), Some(12.5));
    assert_eq!(axis.display_unit(), Unit::Mm);

    axis.set_model("XRT1", 109.0, None).unwrap();
    assert_eq!(axis.kind(), stage_driver_xeryon::AxisKind::Rotary);
    assert_eq!(axis.display_unit(), Unit::Deg);
    assert_eq!(axis.model().full_revolution(), Some(57_644));
    assert_eq!(axis.parameters().value("SSPD"), Some(180.0));

    assert!(axis.set_display_unit(Unit::Mm).is_err());
    assert!(axis.set_model("ABC", 1.0, None).is_err());
    assert_eq!(axis.kind(), stage_driver_xeryon::AxisKind::Rotary);
}

#[tokio::test]
async fn auto_logging_follows_each_move() {
    let mut config = linear_config(1.0);
    config.telemetry.auto_logging = true;
    let (controller, mut device) = open(config).await;
    let axis = controller.axis(None).unwrap();

    // Already at the target: no session is left running
    let report = axis.set_dpos(0).await.unwrap();
    assert_eq!(report.delay, Duration::ZERO);
    device.expect_line("DPOS=0").await;
    assert!(!axis.is_logging());

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.set_dpos(4000).await });
    device.expect_line("DPOS=4000").await;
    assert!(axis.is_logging());

    device.send_str("STAT=1024 EPOS=2000\n").unwrap();
    wait_for(&axis, |s| s.epos == 2000).await;
    device.send_str("STAT=1024 EPOS=4000\n").unwrap();
    request.await.unwrap().unwrap();

    assert!(!axis.is_logging());
    assert_eq!(axis.drain_plot_samples().len(), 2);
}

#[tokio::test]
async fn extreme_encoder_values_keep_telemetry_running() {
    let (controller, device) = open(linear_config(312.5)).await;
    let axis = controller.axis(None).unwrap();

    device.send_str(&format!("STAT=1056 EPOS={}\n", i64::MAX)).unwrap();
    wait_for(&axis, |s| s.epos == i64::MAX).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    device.send_str(&format!("EPOS={}\n", i64::MIN)).unwrap();
    let snap = wait_for(&axis, |s| s.epos == i64::MIN).await;
    assert!(!snap.position_reached);
    assert!(snap.speed.is_finite());

    device.send_str("EPOS=5\n").unwrap();
    wait_for(&axis, |s| s.epos == 5).await;
    assert!(controller.is_running());
}

#[tokio::test]
async fn oversized_step_saturates_to_limit() {
    let (controller, mut device) = open(linear_config(1000.0)).await;
    let axis = controller.axis(None).unwrap();
    set_limits(&axis, -5.0, 5.0);
    device.send_str("EPOS=1000\n").unwrap();
    wait_for(&axis, |s| s.epos == 1000).await;

    let mover = axis.clone();
    let request = tokio::spawn(async move { mover.take_step(1e300, Unit::Mm).await });
    device.expect_line("DPOS=5000").await;
    device.send_str("STAT=1024 EPOS=5000\n").unwrap();
    assert_eq!(request.await.unwrap().unwrap().target, 5000);

    assert!(matches!(
        axis.take_step(f64::NAN, Unit::Mm).await,
        Err(StageError::Configuration(_))
    ));
    assert!(matches!(
        axis.take_step(f64::INFINITY, Unit::Mm).await,
        Err(StageError::Configuration(_))
    ));
}
