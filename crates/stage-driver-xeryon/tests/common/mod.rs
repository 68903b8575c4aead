#![allow(dead_code)]

use stage_core::mock_serial::{self, MockDeviceHarness};
use stage_driver_xeryon::{Axis, AxisSnapshot, Controller, ControllerConfig};
use std::sync::Arc;
use std::time::Duration;

/// Single linear XLS axis on a C controller.
pub fn linear_config(resolution: f64) -> ControllerConfig {
    toml::from_str(&format!(
        r#"
        name = "bench"
        port = "/dev/mock0"
        controller_type = "c"
        load_parameters_on_open = false
        arrival_timeout_ms = 2000

        [[axes]]
        model = "XLS1"
        resolution = {resolution:?}
        "#
    ))
    .unwrap()
}

/// Open `config` against a mock port and consume the initial `INFO=` line.
pub async fn open(config: ControllerConfig) -> (Arc<Controller>, MockDeviceHarness) {
    let (opener, mut device) = mock_serial::opener();
    let controller = Controller::with_opener(config, Arc::new(opener)).unwrap();
    controller.open().await.unwrap();
    device.expect_line("INFO=4").await;
    (controller, device)
}

/// Set soft limits locally, in mm.
pub fn set_limits(axis: &Axis, llim: f64, hlim: f64) {
    let params = axis.parameters();
    params.require("LLIM").unwrap().set(llim).unwrap();
    params.require("HLIM").unwrap().set(hlim).unwrap();
}

/// Wait until a published snapshot satisfies `pred`.
pub async fn wait_for<F>(axis: &Axis, pred: F) -> AxisSnapshot
where
    F: Fn(&AxisSnapshot) -> bool,
{
    let mut rx = axis.subscribe();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&snap) {
                    return snap.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("snapshot condition not reached")
}
