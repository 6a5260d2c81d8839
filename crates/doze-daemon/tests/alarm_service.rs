//! End-to-end tests for the wake-alarm service: deadline ordering, the
//! exactly-once `Now`, the inhibit contract and RTC programming.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use doze_core::alarm::WakeAlarm;
use doze_core::config::ControlPaths;
use doze_core::generation::GenerationStore;
use doze_core::inhibit::InhibitGate;
use doze_daemon::alarm;
use doze_daemon::config::AlarmConfig;
use tempfile::TempDir;
use tokio::time::timeout;

const TICK: Duration = Duration::from_secs(5);

fn unix_now() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs(),
    )
    .unwrap()
}

struct Fixture {
    _tmp: TempDir,
    paths: ControlPaths,
    store: GenerationStore,
    rtc_path: std::path::PathBuf,
    config: AlarmConfig,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let paths = ControlPaths::new(tmp.path().join("suspend"));
    paths.ensure_run_dir().unwrap();
    let store = GenerationStore::new(&paths);
    store.init().unwrap();
    let rtc_path = tmp.path().join("wakealarm");
    let config = AlarmConfig {
        rtc_wakealarm: rtc_path.clone(),
        margin_secs: 4,
        lead_secs: 2,
    };
    Fixture {
        _tmp: tmp,
        paths,
        store,
        rtc_path,
        config,
    }
}

fn with_service<F>(fx: &Fixture, test: F)
where
    F: std::future::Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    let paths = fx.paths.clone();
    let config = fx.config.clone();
    local.block_on(&runtime, async move {
        let service = tokio::task::spawn_local(alarm::run(paths, config));
        timeout(Duration::from_secs(20), test)
            .await
            .expect("test timed out");
        service.abort();
    });
}

async fn connect(fx: &Fixture) -> WakeAlarm {
    for _ in 0..100 {
        if let Ok(alarm) = WakeAlarm::connect(&fx.paths).await {
            return alarm;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("alarm service never came up");
}

async fn announce(store: &GenerationStore) {
    let store = store.clone();
    timeout(
        TICK,
        tokio::task::spawn_blocking(move || store.announce()),
    )
    .await
    .expect("announce stalled")
    .unwrap()
    .unwrap();
}

#[test]
fn registration_echoes_and_fresh_connection_does_not_veto() {
    let fx = fixture();
    with_service(&fx, async {
        let mut alarm = connect(&fx).await;

        // A fresh connection (deadline "never") must not block suspend.
        let gate = InhibitGate::open(&fx.paths).unwrap();
        assert!(gate.probe().unwrap(), "fresh connection vetoed suspend");

        let when = unix_now() + 1000;
        let echoed = alarm.schedule(when).await.unwrap();
        assert_eq!(echoed, when);
    });
}

#[test]
fn passed_deadline_fires_once_and_vetoes_suspend() {
    let fx = fixture();
    with_service(&fx, async {
        let mut alarm = connect(&fx).await;

        let when = unix_now() + 1;
        alarm.schedule(when).await.unwrap();
        timeout(TICK, alarm.wait_for_fire())
            .await
            .expect("deadline never fired")
            .unwrap();

        // A fired, unhandled deadline keeps the machine awake.
        let gate = InhibitGate::open(&fx.paths).unwrap();
        assert!(!gate.probe().unwrap(), "fired deadline did not veto");

        // Handling it (registering a new, far deadline) releases the veto.
        alarm.schedule(unix_now() + 1000).await.unwrap();
        wait_until(|| gate.probe().unwrap()).await;
    });
}

#[test]
fn already_passed_deadline_fires_immediately() {
    let fx = fixture();
    with_service(&fx, async {
        let mut alarm = connect(&fx).await;

        let when = unix_now() - 5;
        let echoed = alarm.schedule(when).await.unwrap();
        assert_eq!(echoed, when);
        timeout(TICK, alarm.wait_for_fire())
            .await
            .expect("past deadline never fired")
            .unwrap();
    });
}

#[test]
fn far_deadline_programs_rtc_and_allows_suspend() {
    let fx = fixture();
    with_service(&fx, async {
        let mut alarm = connect(&fx).await;

        let when = unix_now() + 1000;
        alarm.schedule(when).await.unwrap();

        // Suspend: the service must arm the hardware and acknowledge.
        announce(&fx.store).await;
        fx.store.rotate().unwrap();

        let rtc = std::fs::read_to_string(&fx.rtc_path).unwrap();
        assert_eq!(rtc, format!("0\n{}\n", when - 2), "RTC must be armed at deadline - lead");

        let gate = InhibitGate::open(&fx.paths).unwrap();
        assert!(gate.probe().unwrap(), "far deadline must not veto suspend");
    });
}

#[test]
fn near_deadline_blocks_suspend_until_it_fires() {
    let fx = fixture();
    with_service(&fx, async {
        let mut alarm = connect(&fx).await;

        // Inside the 4s margin: the service takes the inhibitor instead
        // of arming the hardware.
        let when = unix_now() + 2;
        alarm.schedule(when).await.unwrap();

        announce(&fx.store).await;
        fx.store.rotate().unwrap();

        let gate = InhibitGate::open(&fx.paths).unwrap();
        assert!(!gate.probe().unwrap(), "near deadline must veto suspend");
        assert!(
            !fx.rtc_path.exists(),
            "no hardware alarm for a deadline we stay up for"
        );

        timeout(TICK, alarm.wait_for_fire())
            .await
            .expect("near deadline never fired")
            .unwrap();
    });
}

#[test]
fn disconnect_releases_active_veto() {
    let fx = fixture();
    with_service(&fx, async {
        let mut alarm = connect(&fx).await;
        alarm.schedule(unix_now() - 1).await.unwrap();
        timeout(TICK, alarm.wait_for_fire()).await.unwrap().unwrap();

        let gate = InhibitGate::open(&fx.paths).unwrap();
        assert!(!gate.probe().unwrap());

        drop(alarm);
        wait_until(|| gate.probe().unwrap()).await;
    });
}

#[test]
fn malformed_deadline_tears_down_the_connection() {
    let fx = fixture();
    with_service(&fx, async {
        let _warmup = connect(&fx).await;

        let stream = tokio::net::UnixStream::connect(fx.paths.wakealarm_socket())
            .await
            .unwrap();
        // Consume the greeting.
        let mut buf = [0u8; 8];
        stream.readable().await.unwrap();
        stream.try_read(&mut buf).unwrap();

        stream.writable().await.unwrap();
        stream.try_write(b"soon\n").unwrap();

        // The service closes the connection; a read observes EOF.
        let closed = timeout(TICK, async {
            loop {
                stream.readable().await.unwrap();
                match stream.try_read(&mut buf) {
                    Ok(0) => return true,
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => return true,
                }
            }
        })
        .await
        .expect("connection was not torn down");
        assert!(closed);
    });
}

/// Poll a condition that a single-threaded service settles asynchronously.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}
