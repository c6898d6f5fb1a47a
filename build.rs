/// Compile-time configuration with the values the broker node ships with.
const DEFAULTS: &[(&str, &str)] = &[
    ("BROKER_HOST", "public.cloud.shiftr.io"),
    ("BROKER_CLIENT_ID", "arduino"),
    ("BROKER_USERNAME", "public"),
    ("BROKER_PASSWORD", "public"),
    ("BROKER_TOPIC", "/hello"),
    ("DEVICE_HOSTNAME", "eth-board"),
];

fn main() {
    // Load .env file for broker configuration
    load_env_config();

    // Host builds (tests) link with the system linker
    if std::env::var_os("CARGO_FEATURE_FIRMWARE").is_some() {
        linker_be_nice();
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg=-Tlinkall.x");
    }
}

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    for (name, default) in DEFAULTS {
        // Tell cargo to rerun if environment variables change
        println!("cargo:rerun-if-env-changed={}", name);

        // Empty values count as unset
        let value = env::var(name)
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty());

        match value {
            Some(value) => {
                if *name == "BROKER_PASSWORD" {
                    println!("cargo:warning={} configured (length: {})", name, value.len());
                } else {
                    println!("cargo:warning={} configured: {}", name, value);
                }
                println!("cargo:rustc-env={}={}", name, value);
            }
            None => println!("cargo:rustc-env={}={}", name, default),
        }
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_defmt_timestamp" => {
                    eprintln!();
                    eprintln!("💡 `defmt` not found - make sure `defmt.x` is added as a linker script and you have included `use defmt_rtt as _;`");
                    eprintln!();
                }
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "__embassy_time_schedule_wake" | "_embassy_time_schedule_wake" => {
                    eprintln!();
                    eprintln!("💡 No embassy time driver found. Make sure `esp_hal_embassy::init` is called and the `firmware` feature is enabled.");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
