use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::thread;

// Prefix metrics with `splitpay_` for better namespacing.
lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SETTLE_REQUESTS: IntCounter =
        IntCounter::new("splitpay_settle_requests", "Settlement requests received")
            .expect("metric can be created");
    pub static ref BUILD_REQUESTS: IntCounter =
        IntCounter::new("splitpay_build_requests", "Payment transaction build requests")
            .expect("metric can be created");
    pub static ref VERIFY_OK: IntCounter =
        IntCounter::new("splitpay_verify_ok", "Payments verified successfully")
            .expect("metric can be created");
    pub static ref VERIFY_FAIL: IntCounter =
        IntCounter::new("splitpay_verify_fail", "Payments rejected during verification")
            .expect("metric can be created");
    pub static ref REPLAY_ATTEMPTS: IntCounter =
        IntCounter::new("splitpay_replay_attempts", "Reuse attempts of an accepted signature")
            .expect("metric can be created");
    pub static ref REFERRAL_RECORDED: IntCounter =
        IntCounter::new("splitpay_referral_recorded", "Referral earnings recorded")
            .expect("metric can be created");
    pub static ref REFERRAL_RECORD_FAILED: IntCounter =
        IntCounter::new("splitpay_referral_record_failed", "Referral earnings that failed to record")
            .expect("metric can be created");
    pub static ref EVICTED_SIGNATURES: IntCounter =
        IntCounter::new("splitpay_evicted_signatures", "Signatures evicted from the replay guard")
            .expect("metric can be created");
}

fn register_all() -> Result<()> {
    let counters: [&IntCounter; 8] = [
        &SETTLE_REQUESTS,
        &BUILD_REQUESTS,
        &VERIFY_OK,
        &VERIFY_FAIL,
        &REPLAY_ATTEMPTS,
        &REFERRAL_RECORDED,
        &REFERRAL_RECORD_FAILED,
        &EVICTED_SIGNATURES,
    ];
    for c in counters {
        REGISTRY.register(Box::new((*c).clone()))?;
    }
    Ok(())
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    register_all()?;

    let bind_addr = cfg.bind.clone();
    thread::spawn(move || {
        let server = match tiny_http::Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("🔥 Could not start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            let metric_families = REGISTRY.gather();
            if encoder.encode(&metric_families, &mut buffer).is_err() {
                eprintln!("🔥 Could not encode metrics");
                continue;
            }

            let response = tiny_http::Response::from_data(buffer)
                .with_header("Content-Type: application/openmetrics-text; version=1.0.0; charset=utf-8".parse::<tiny_http::Header>().unwrap());

            let _ = request.respond(response);
        }
    });

    Ok(())
}
