mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{bootstrap_unit, wait_running, wait_stopped};
use copr::archive;
use copr::control::Controller;
use copr::secrets::Secrets;
use copr::service::{CtlResponse, Service};

const CTL_ADDR: &str = "127.0.0.1:21901";
const API_KEY: &str = "test-api-key";
const UNIT_PORT: u16 = 31021;
const DEPLOY_PORT: u16 = 31022;

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

async fn wait_ctl_up() {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let r = client()
            .get(format!("http://{CTL_ADDR}/stat"))
            .bearer_auth(API_KEY)
            .send()
            .await;
        if matches!(&r, Ok(resp) if resp.status().is_success()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "control plane did not come up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn control_plane_round_trip() {
    let ws = tempfile::tempdir().unwrap();
    bootstrap_unit(&ws.path().join("unit_01"), UNIT_PORT, Vec::new(), true).unwrap();

    let secs = Secrets::load(ws.path().join("copr.secrets"), "pwd").unwrap();
    let controller = Controller::new(ws.path(), Arc::new(secs), BTreeMap::new()).unwrap();
    let service = Service::new(CTL_ADDR, controller, API_KEY);

    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run_ctx(cancel).await })
    };

    wait_ctl_up().await;

    // the service starts the fleet on boot
    assert!(wait_running(UNIT_PORT, Duration::from_secs(5)).await);

    // bad token -> 401 unauthorized
    let resp = client()
        .get(format!("http://{CTL_ADDR}/stat"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let ctl: CtlResponse = resp.json().await.unwrap();
    assert_eq!(ctl.errors, vec!["unauthorized".to_string()]);

    // missing header -> 401 as well
    let resp = client()
        .post(format!("http://{CTL_ADDR}/stop-all"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    // unknown path -> 404
    let resp = client()
        .get(format!("http://{CTL_ADDR}/frobnicate"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // stat all
    let resp = client()
        .get(format!("http://{CTL_ADDR}/stat"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let ctl: CtlResponse = resp.json().await.unwrap();
    assert!(ctl.errors.is_empty());
    assert_eq!(ctl.messages.len(), 1);
    assert!(ctl.messages[0].contains("unit_01"));

    // stop one unit over HTTP
    let resp = client()
        .post(format!("http://{CTL_ADDR}/stop?unit=unit_01"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let ctl: CtlResponse = resp.json().await.unwrap();
    assert!(ctl.errors.is_empty(), "{:?}", ctl.errors);
    assert!(wait_stopped(UNIT_PORT, Duration::from_secs(2)).await);

    // logical errors still come back with 200
    let resp = client()
        .post(format!("http://{CTL_ADDR}/start?unit=nope"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let ctl: CtlResponse = resp.json().await.unwrap();
    assert!(!ctl.errors.is_empty());

    // deploy a new unit: zip a staging tree and upload it
    let staging = tempfile::tempdir().unwrap();
    let staged = staging.path().join("unit_02");
    bootstrap_unit(&staged, DEPLOY_PORT, Vec::new(), true).unwrap();
    let bundle = archive::zip_dir_to_vec(&staged).unwrap();

    let resp = client()
        .post(format!("http://{CTL_ADDR}/deploy?unit=unit_02"))
        .bearer_auth(API_KEY)
        .body(bundle)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let ctl: CtlResponse = resp.json().await.unwrap();
    assert!(ctl.errors.is_empty(), "deploy: {:?}", ctl.errors);
    assert!(wait_running(DEPLOY_PORT, Duration::from_secs(5)).await);
    assert!(ws.path().join("unit_02").join("copr.unit.json").exists());

    // garbage upload -> 500 transport failure
    let resp = client()
        .post(format!("http://{CTL_ADDR}/deploy?unit=unit_03"))
        .bearer_auth(API_KEY)
        .body(vec![0u8; 16])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("service shuts down")
        .unwrap()
        .unwrap();
}
