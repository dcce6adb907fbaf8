pub const TOPIC_ROOT: &str = "solar_power_regulator";

pub const TOPIC_RUN: &str = "solar_power_regulator/run";
pub const TOPIC_EVT: &str = "solar_power_regulator/evt";

pub fn topic(root: &str, suffix: &str) -> String {
    format!("{root}/{suffix}")
}
