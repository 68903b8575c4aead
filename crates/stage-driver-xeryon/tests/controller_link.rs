//! Controller lifecycle, demultiplexing, parameter sync and the registry.

mod common;

use approx::assert_relative_eq;
use common::{linear_config, open, wait_for};
use stage_core::dispatch;
use stage_core::error::StageError;
use stage_core::mock_serial;
use stage_driver_xeryon::{Controller, ControllerConfig, ControllerRegistry, XeryonFactory};
use std::sync::Arc;

fn two_axis_config() -> ControllerConfig {
    toml::from_str(
        r#"
        name = "gantry"
        port = "/dev/mock1"
        controller_type = "m"
        load_parameters_on_open = false

        [[axes]]
        letter = "X"
        model = "XLS1"
        resolution = 312.5

        [[axes]]
        letter = "Y"
        model = "XRT1"
        resolution = 109.0
        "#,
    )
    .unwrap()
}

#[tokio::test]
async fn multi_axis_telemetry_is_demultiplexed() {
    let (controller, mut device) = open(two_axis_config()).await;
    let x = controller.axis(Some('x')).unwrap();
    let y = controller.axis(Some('Y')).unwrap();
    assert_eq!((x.axis_index(), y.axis_index()), (0, 1));

    device
        .send_str("X:EPOS=100 Y:EPOS=200 X:STAT=1024 EPOS=999 Z:EPOS=5\n")
        .unwrap();
    let xs = wait_for(&x, |s| s.epos == 100).await;
    let ys = wait_for(&y, |s| s.epos == 200).await;
    assert!(xs.flags.position_reached);
    assert!(!ys.flags.position_reached);

    // Commands carry the letter prefix
    y.stop().await.unwrap();
    device.expect_line("Y:STOP").await;
    assert!(matches!(
        controller.axis(Some('Q')),
        Err(StageError::AxisNotFound(_))
    ));
}

#[tokio::test]
async fn telemetry_split_across_reads() {
    let (controller, device) = open(linear_config(312.5)).await;
    let axis = controller.axis(None).unwrap();

    device.send_str("STAT=1024 EP").unwrap();
    device.send_str("OS=1234 TIME=7\n").unwrap();
    let snap = wait_for(&axis, |s| s.epos == 1234).await;
    assert_eq!(snap.time_ticks, Some(7));
}

#[tokio::test]
async fn parameter_sync_skips_unanswered_queries() {
    let mut config = linear_config(312.5);
    config.read_timeout_ms = 50;
    let (controller, mut device) = open(config).await;
    let axis = controller.axis(None).unwrap();
    let mnemonics: Vec<&str> = axis.parameters().iter().map(|p| p.mnemonic()).collect();
    assert_eq!(mnemonics.len(), 15, "C controllers include MASS");

    let loader = controller.clone();
    let sync = tokio::spawn(async move { loader.load_parameters_from_controller().await });

    device.expect_line("INFO=0").await;
    for mnemonic in &mnemonics {
        device.expect_line(&format!("{}=?", mnemonic)).await;
        let answer = match *mnemonic {
            "ELIM" => continue,
            "SSPD" => "SSPD=50000\n".to_string(),
            "PTO2" => "PTO2=4\n".to_string(),
            "LLIM" => "LLIM=-16000\n".to_string(),
            "CFRQ" => "CFRQ=850000\n".to_string(),
            other => format!("{}=1\n", other),
        };
        device.send_str(&answer).unwrap();
    }
    device.expect_line("INFO=4").await;

    let report = sync.await.unwrap().unwrap();
    assert_eq!(report.loaded, 14);
    assert_eq!(report.skipped, vec!["ELIM".to_string()]);

    let params = axis.parameters();
    assert_relative_eq!(params.value("SSPD").unwrap(), 50.0);
    assert_relative_eq!(params.value("LLIM").unwrap(), -5.0);
    assert_relative_eq!(params.value("CFRQ").unwrap(), 85_000.0);
    assert_relative_eq!(params.pto2(), 4.0);

    // Telemetry resumes after the sync
    device.send_str("EPOS=77\n").unwrap();
    wait_for(&axis, |s| s.epos == 77).await;
}

#[tokio::test]
async fn parameters_load_on_open() {
    let mut config = linear_config(312.5);
    config.load_parameters_on_open = true;
    config.read_timeout_ms = 20;
    let (opener, mut device) = mock_serial::opener();
    let controller = Controller::with_opener(config, Arc::new(opener)).unwrap();

    controller.open().await.unwrap();
    device.expect_line("INFO=0").await;
    device.expect_and_respond("SSPD=?", "SSPD=20000\n").await;
    let skipped = device.expect_line_eventually("INFO=4").await;
    assert_eq!(skipped.len(), 14);

    let axis = controller.axis(None).unwrap();
    assert_relative_eq!(axis.parameters().value("SSPD").unwrap(), 20.0);
}

#[tokio::test]
async fn parameter_edit_is_clamped_and_sent() {
    let (controller, mut device) = open(linear_config(312.5)).await;
    let axis = controller.axis(None).unwrap();

    assert!(axis.set_parameter("sspd", 12.5).await.unwrap());
    device.expect_line("SSPD=12500").await;

    // Clamped to the 400 mm/s maximum
    assert!(axis.set_parameter("SSPD", 1e6).await.unwrap());
    device.expect_line("SSPD=400000").await;

    // Unchanged value is not re-sent
    assert!(!axis.set_parameter("SSPD", 400.0).await.unwrap());

    assert!(axis.increment_parameter("ZON1").await.unwrap());
    let line = device.next_line().await.unwrap();
    assert!(line.starts_with("ZON1="), "{}", line);

    assert!(matches!(
        axis.set_parameter("NOPE", 1.0).await,
        Err(StageError::UnknownParameter(_))
    ));
}

#[tokio::test]
async fn open_port_toggles() {
    let (opener, mut device) = mock_serial::opener();
    let controller = Controller::with_opener(linear_config(312.5), Arc::new(opener)).unwrap();
    let mut running = controller.subscribe_running();

    assert!(controller.open_port().await.unwrap());
    device.expect_line("INFO=4").await;
    assert!(*running.borrow_and_update());

    assert!(!controller.open_port().await.unwrap());
    assert!(!*running.borrow_and_update());

    // The mock opener had a single port
    assert!(matches!(controller.open().await, Err(StageError::Io(_))));
}

#[tokio::test]
async fn failed_telemetry_start_leaves_link_closed() {
    let (opener, device) = mock_serial::opener();
    drop(device);
    let controller = Controller::with_opener(linear_config(312.5), Arc::new(opener)).unwrap();
    let mut running = controller.subscribe_running();

    assert!(matches!(controller.open().await, Err(StageError::Io(_))));
    assert!(!controller.is_running());
    assert!(!*running.borrow_and_update());
    assert!(matches!(
        controller.send_command("STOP", None).await,
        Err(StageError::NotConnected(_))
    ));
}

#[tokio::test]
async fn registry_tracks_running_subset() {
    let registry = ControllerRegistry::new();

    let (opener_a, _device_a) = mock_serial::opener();
    let a = Controller::with_opener(linear_config(312.5), Arc::new(opener_a)).unwrap();
    let (opener_b, _device_b) = mock_serial::opener();
    let b = Controller::with_opener(two_axis_config(), Arc::new(opener_b)).unwrap();

    registry.add_found(a.clone()).unwrap();
    registry.add_found(b).unwrap();
    assert_eq!(registry.len(), 2);
    assert!(registry.running().is_empty());

    registry.start("bench").await.unwrap();
    let running: Vec<String> = registry.running().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(running, vec!["bench".to_string()]);

    // Running controllers are protected
    assert!(matches!(
        registry.remove_found("bench"),
        Err(StageError::ControllerRunning(_))
    ));
    let (opener_c, _device_c) = mock_serial::opener();
    let replacement = Controller::with_opener(linear_config(312.5), Arc::new(opener_c)).unwrap();
    assert!(registry.add_found(replacement).is_err());

    // Only the stopped controller is pruned
    let pruned = registry.prune(&[]);
    assert_eq!(pruned, vec!["gantry".to_string()]);
    assert!(registry.get("gantry").is_err());

    assert!(!registry.toggle("bench").await.unwrap());
    assert!(registry.running().is_empty());
    registry.remove_found("bench").unwrap();
    assert!(registry.is_empty());
    assert!(matches!(
        registry.stop("bench").await,
        Err(StageError::ControllerNotFound(_))
    ));
}

#[tokio::test]
async fn factory_builds_stopped_controller() {
    let section = toml::Value::Table(toml::toml! {
        name = "bench"
        port = "/dev/mock0"
        controller_type = "c"
        load_parameters_on_open = false
        [[axes]]
        model = "XLA1"
        resolution = 1250.0
        display_unit = "mu"
    });
    XeryonFactory.validate(&section).unwrap();

    let (opener, mut device) = mock_serial::opener();
    let controller = XeryonFactory
        .build_with(section, Arc::new(opener), dispatch::inline())
        .await
        .unwrap();
    assert!(!controller.is_running());
    assert_eq!(controller.axes().len(), 1);

    controller.open().await.unwrap();
    device.expect_line("INFO=4").await;
    controller.close().await.unwrap();
}
