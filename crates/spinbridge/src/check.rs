//! Output for the `check` subcommand.

use tabled::{builder::Builder, settings::Style};

use spinbridge_core::RadioInfo;

/// Render the host radios as a table, marking `selected` in the first column.
pub fn format_radio_table(radios: &[RadioInfo], selected: Option<u32>) -> String {
    if radios.is_empty() {
        return "No Bluetooth radios found".to_string();
    }

    let mut builder = Builder::default();
    builder.push_record(["", "Radio", "Bus", "Address", "Up", "Manufacturer"]);
    for radio in radios {
        builder.push_record([
            if Some(radio.index) == selected { "*" } else { "" }.to_string(),
            format!("hci{}", radio.index),
            radio.bus.clone().unwrap_or_else(|| "-".to_string()),
            radio.address.clone().unwrap_or_else(|| "-".to_string()),
            if radio.up { "yes" } else { "no" }.to_string(),
            radio
                .manufacturer
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}
