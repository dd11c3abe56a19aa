//! Server settings exposed as gauges.
//!
//! Every numeric or boolean row of `pg_settings` becomes one
//! `pg_settings_<name>` gauge. Time units are normalised to seconds and size
//! units to bytes, with the unit appended to the metric name.

use crate::connection::Row;
use crate::values::parse_bool;

pub const SETTINGS_QUERY: &str = "SELECT name, setting, COALESCE(unit, '') AS unit, short_desc, vartype \
     FROM pg_settings \
     WHERE vartype IN ('bool', 'integer', 'real') AND name != 'sync_commit_cancel_wait'";

/// Name of the family template registered for settings metrics.
pub const SETTINGS_METRIC_PREFIX: &str = "pg_settings";

/// One normalised setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingValue {
    pub metric_name: String,
    pub help: String,
    pub value: f64,
}

/// Converts one `pg_settings` row.
pub fn setting_from_row(row: &Row) -> Result<SettingValue, String> {
    let name = row.get("name").ok_or("pg_settings row without name")?;
    let setting = row.get("setting").unwrap_or_default();
    let unit = row.get("unit").unwrap_or_default();
    let vartype = row.get("vartype").unwrap_or_default();
    normalise(name, setting, unit, vartype)
}

pub fn normalise(name: &str, setting: &str, unit: &str, vartype: &str) -> Result<SettingValue, String> {
    let base_name = format!(
        "{SETTINGS_METRIC_PREFIX}_{}",
        name.replace(['.', '-'], "_")
    );
    let mut help = format!("Server Parameter: {name}");

    let raw = match vartype {
        "bool" => {
            let on = parse_bool(setting)
                .ok_or_else(|| format!("setting {name}: invalid bool {setting:?}"))?;
            return Ok(SettingValue {
                metric_name: base_name,
                help,
                value: if on { 1.0 } else { 0.0 },
            });
        }
        "integer" | "real" => setting
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("setting {name}: invalid {vartype} {setting:?}"))?,
        other => return Err(format!("setting {name}: unsupported vartype {other:?}")),
    };

    if unit.is_empty() {
        return Ok(SettingValue {
            metric_name: base_name,
            help,
            value: raw,
        });
    }

    let (factor, suffix) = unit_factor(unit).ok_or_else(|| format!("setting {name}: unknown unit {unit:?}"))?;
    // -1 is the "disabled" sentinel for many settings and stays as is.
    let value = if raw == -1.0 { raw } else { raw * factor };
    help.push_str(&format!(" [Units converted to {suffix}.]"));

    Ok(SettingValue {
        metric_name: format!("{base_name}_{suffix}"),
        help,
        value,
    })
}

fn unit_factor(unit: &str) -> Option<(f64, &'static str)> {
    const KB: f64 = 1024.0;
    let factor = match unit {
        "ms" => return Some((1.0 / 1000.0, "seconds")),
        "s" => return Some((1.0, "seconds")),
        "min" => return Some((60.0, "seconds")),
        "h" => return Some((3600.0, "seconds")),
        "d" => return Some((86_400.0, "seconds")),
        "B" => 1.0,
        "kB" | "1kB" => KB,
        "2kB" => 2.0 * KB,
        "4kB" => 4.0 * KB,
        "8kB" => 8.0 * KB,
        "16kB" => 16.0 * KB,
        "32kB" => 32.0 * KB,
        "64kB" => 64.0 * KB,
        "MB" => KB * KB,
        "16MB" => 16.0 * KB * KB,
        "32MB" => 32.0 * KB * KB,
        "64MB" => 64.0 * KB * KB,
        "GB" => KB * KB * KB,
        "TB" => KB * KB * KB * KB,
        _ => return None,
    };
    Some((factor, "bytes"))
}
