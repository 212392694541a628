//! Build script for telenode-firmware
//!
//! - Adds the esp-hal and defmt linker scripts
//! - Loads node.toml (plus node.local.toml when present), validates every
//!   device configuration, checks the INA226 calibration each one asks for
//!   and embeds the result as postcard bytes

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use telenode_core::config::{ConfigSet, NodeConfig};
use telenode_drivers::ina226::{BUS_RANGE_VOLTS, GAIN_VOLTS};
use telenode_drivers::CalibrationParameters;

const BASE_CONFIG: &str = "node.toml";
const LOCAL_CONFIG: &str = "node.local.toml";
const EMBEDDED_NAME: &str = "config.postcard";

fn main() {
    setup_linker();
    embed_config();
}

fn setup_linker() {
    println!("cargo:rustc-link-arg-bins=-Tlinkall.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
    println!("cargo:rerun-if-changed=build.rs");
}

fn embed_config() {
    println!("cargo:rerun-if-changed={}", BASE_CONFIG);
    println!("cargo:rerun-if-changed={}", LOCAL_CONFIG);

    let base = match fs::read_to_string(BASE_CONFIG) {
        Ok(content) => content,
        Err(e) => fail(
            &format!("Failed to read {}", BASE_CONFIG),
            &format!(
                "{}\nThe firmware requires a {} in the telenode-firmware directory.",
                e, BASE_CONFIG
            ),
        ),
    };

    let local = if Path::new(LOCAL_CONFIG).exists() {
        match fs::read_to_string(LOCAL_CONFIG) {
            Ok(content) => Some(content),
            Err(e) => fail(&format!("Failed to read {}", LOCAL_CONFIG), &e.to_string()),
        }
    } else {
        None
    };

    let set = match ConfigSet::from_toml(&base, local.as_deref()) {
        Ok(set) => set,
        Err(e) => fail("Invalid node configuration", &e.to_string()),
    };

    check_calibration("base", &set.base);
    for device in &set.devices {
        let mac = device
            .mac
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        check_calibration(&mac, &device.config);
    }

    let bytes = match postcard::to_allocvec(&set) {
        Ok(bytes) => bytes,
        Err(e) => fail("Failed to encode node configuration", &e.to_string()),
    };

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap_or_else(|_| fail("OUT_DIR not set", "")));
    if let Err(e) = fs::write(out_dir.join(EMBEDDED_NAME), &bytes) {
        fail("Failed to write embedded configuration", &e.to_string());
    }

    let source = if local.is_some() {
        format!("{} + {}", BASE_CONFIG, LOCAL_CONFIG)
    } else {
        BASE_CONFIG.to_string()
    };
    println!(
        "cargo:warning={} validated: {} device override(s), {} bytes embedded",
        source,
        set.devices.len(),
        bytes.len()
    );
}

/// Reject shunt/current combinations the INA226 cannot be calibrated for
fn check_calibration(which: &str, config: &NodeConfig) {
    let Some(ina) = &config.ina226 else {
        return;
    };
    let result = CalibrationParameters::calculate::<()>(
        ina.shunt_ohms,
        BUS_RANGE_VOLTS,
        GAIN_VOLTS,
        ina.max_expected_amps,
    );
    if result.is_err() {
        fail(
            "Impossible INA226 calibration",
            &format!(
                "[{}] shunt_ohms = {}, max_expected_amps = {:?}\n\
                The shunt cannot measure more than {:.3} A.",
                which,
                ina.shunt_ohms,
                ina.max_expected_amps,
                GAIN_VOLTS / ina.shunt_ohms
            ),
        );
    }
}

/// Abort the build with a boxed error message
fn fail(title: &str, detail: &str) -> ! {
    panic!(
        "\n\
        ╔══════════════════════════════════════════════════════════════════╗\n\
        ║  ERROR: {:<57}║\n\
        ╠══════════════════════════════════════════════════════════════════╣\n\
        {}\n\
        ╚══════════════════════════════════════════════════════════════════╝\n",
        title,
        format_error_lines(detail)
    );
}

/// Format error message lines with box drawing
fn format_error_lines(msg: &str) -> String {
    msg.lines()
        .map(|line| {
            let truncated = if line.chars().count() > 64 {
                format!("{}...", line.chars().take(61).collect::<String>())
            } else {
                line.to_string()
            };
            format!("║  {:<64} ║", truncated)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
