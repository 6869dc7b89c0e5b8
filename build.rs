fn main() {
    dotenvy::from_filename(".env.development.local").ok();

    let keys = [
        "FINALITY_LOCK_SECS",
        "RESOLVER_EXCLUSIVE_SECS",
        "CANCELLATION_SECS",
        "MINIMUM_DEPOSIT",
        "MAXIMUM_DEPOSIT",
        "CLAIM_WINDOW_SECS",
        "REFUND_WINDOW_SECS",
        "INCENTIVE_MULTIPLIER_BPS",
        "MAX_PARTS",
        "MIN_FILL_AMOUNT",
        "MAX_FILL_PERCENTAGE_BPS",
        "AUCTION_TICK_MILLIS",
    ];

    for key in keys {
        if let Ok(val) = std::env::var(key) {
            println!("cargo:rustc-env={}={}", key, val);
        }
    }

    println!("cargo:rerun-if-changed=.env.development.local");
}
