//! Parsers for `nvidia-smi` output

use cogs_core::{Claim, CogsError, CogsResult, Device, MonitorConfig};

/// Columns printed by `nvidia-smi dmon`
pub const METRICS_FIELDS: usize = 10;
/// Columns printed by `nvidia-smi pmon`
pub const PROCESS_FIELDS: usize = 8;

/// One row of the metrics feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSample {
    pub number: u32,
    pub temperature: u32,
    pub utilization: u32,
    pub memory: u64,
}

impl MetricsSample {
    /// Copy the sampled values onto a device
    pub fn apply_to(&self, device: &mut Device) {
        device.temperature = self.temperature;
        device.utilization = self.utilization;
        device.memory = self.memory;
    }
}

/// Split a feed line into fields, `None` for header, comment or blank lines
fn tokenize(line: &str) -> Option<Vec<&str>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.split_whitespace().collect())
}

/// Parse a numeric field; `-` means "not available" and reads as zero
fn field(token: &str) -> CogsResult<u64> {
    if token == "-" {
        return Ok(0);
    }
    token
        .parse()
        .map_err(|_| CogsError::Parse(format!("not a number: {:?}", token)))
}

fn narrow(value: u64) -> CogsResult<u32> {
    u32::try_from(value).map_err(|_| CogsError::Parse(format!("value out of range: {}", value)))
}

/// Parse one line of the metrics feed
///
/// Every column must be numeric or `-`. Returns `Ok(None)` for lines
/// carrying no sample.
pub fn parse_metrics_line(line: &str) -> CogsResult<Option<MetricsSample>> {
    let Some(tokens) = tokenize(line) else {
        return Ok(None);
    };

    if tokens.len() != METRICS_FIELDS {
        return Err(CogsError::Parse(format!(
            "expected {} fields, got {}",
            METRICS_FIELDS,
            tokens.len()
        )));
    }

    let values = tokens
        .iter()
        .map(|t| field(t))
        .collect::<CogsResult<Vec<u64>>>()?;

    Ok(Some(MetricsSample {
        number: narrow(values[0])?,
        temperature: narrow(values[2])?,
        utilization: narrow(values[4])?,
        memory: values[5],
    }))
}

/// Parse one line of the process feed into a claim observation
pub fn parse_process_line(line: &str) -> CogsResult<Option<Claim>> {
    let Some(tokens) = tokenize(line) else {
        return Ok(None);
    };

    if tokens.len() != PROCESS_FIELDS {
        return Err(CogsError::Parse(format!(
            "expected {} fields, got {}",
            PROCESS_FIELDS,
            tokens.len()
        )));
    }

    Ok(Some(Claim {
        device_number: narrow(field(tokens[0])?)?,
        pid: narrow(field(tokens[1])?)?,
    }))
}

/// Marketing brand derived from a product name
///
/// `NVIDIA GeForce RTX 3090` is a `GeForce`, `Tesla V100-SXM2-16GB` a `Tesla`.
pub fn brand_from_name(name: &str) -> String {
    let mut words = name.split_whitespace();
    match words.next() {
        Some(first) if first.eq_ignore_ascii_case("nvidia") => {
            words.next().unwrap_or(first).to_string()
        }
        Some(first) => first.to_string(),
        None => String::new(),
    }
}

/// Parse `--query-gpu=index,uuid,name --format=csv,noheader` output
pub fn parse_inventory(output: &str, config: &MonitorConfig) -> CogsResult<Vec<Device>> {
    let mut devices = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut columns = line.splitn(3, ',').map(str::trim);
        let (Some(index), Some(uuid), Some(name)) = (columns.next(), columns.next(), columns.next())
        else {
            return Err(CogsError::Parse(format!("malformed inventory line: {:?}", line)));
        };

        let number = index
            .parse()
            .map_err(|_| CogsError::Parse(format!("invalid device index: {:?}", index)))?;

        let mut device = Device::new(number, uuid, name);
        device.brand = brand_from_name(name);
        if let Some(group) = config.group_for(number) {
            device.group = group.to_string();
        }
        devices.push(device);
    }

    devices.sort_by_key(|d| d.number);
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_line() {
        let sample = parse_metrics_line("0 - 45 - 80 2048 - - - -").unwrap().unwrap();
        assert_eq!(
            sample,
            MetricsSample {
                number: 0,
                temperature: 45,
                utilization: 80,
                memory: 2048,
            }
        );

        let sample = parse_metrics_line("    1    71    52     -    99    34     0     0  5001  1590")
            .unwrap()
            .unwrap();
        assert_eq!(sample.number, 1);
        assert_eq!(sample.temperature, 52);
        assert_eq!(sample.utilization, 99);
        assert_eq!(sample.memory, 34);
    }

    #[test]
    fn test_metrics_headers_skipped() {
        assert!(parse_metrics_line("# gpu   pwr gtemp mtemp    sm   mem   enc   dec  mclk  pclk")
            .unwrap()
            .is_none());
        assert!(parse_metrics_line("# Idx     W     C     C     %     %     %     %   MHz   MHz")
            .unwrap()
            .is_none());
        assert!(parse_metrics_line("   ").unwrap().is_none());
    }

    #[test]
    fn test_metrics_malformed() {
        assert!(parse_metrics_line("0 - 45 - 80").is_err());
        assert!(parse_metrics_line("0 - 45 - 80 2048 - - - - -").is_err());
        assert!(parse_metrics_line("0 - hot - 80 2048 - - - -").is_err());
    }

    #[test]
    fn test_process_line() {
        let claim = parse_process_line("    0      31337     C    45    12     -     -   python")
            .unwrap()
            .unwrap();
        assert_eq!(
            claim,
            Claim {
                device_number: 0,
                pid: 31337,
            }
        );

        let idle = parse_process_line("    1          -     -     -     -     -     -   -")
            .unwrap()
            .unwrap();
        assert!(idle.is_vacant());
        assert_eq!(idle.device_number, 1);

        assert!(parse_process_line("# gpu        pid  type    sm   mem   enc   dec   command")
            .unwrap()
            .is_none());
        assert!(parse_process_line("0 1234 C").is_err());
        assert!(parse_process_line("x 1234 C 1 1 - - cmd").is_err());
    }

    #[test]
    fn test_brand_from_name() {
        assert_eq!(brand_from_name("NVIDIA GeForce RTX 3090"), "GeForce");
        assert_eq!(brand_from_name("Tesla V100-SXM2-16GB"), "Tesla");
        assert_eq!(brand_from_name("NVIDIA"), "NVIDIA");
        assert_eq!(brand_from_name(""), "");
    }

    #[test]
    fn test_parse_inventory() {
        let mut config = MonitorConfig::default();
        config.groups.insert("1".to_string(), "training".to_string());

        let output = "1, GPU-bbbb, NVIDIA A100-SXM4-40GB\n0, GPU-aaaa, Tesla T4\n\n";
        let devices = parse_inventory(output, &config).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].number, 0);
        assert_eq!(devices[0].uuid, "GPU-aaaa");
        assert_eq!(devices[0].brand, "Tesla");
        assert_eq!(devices[0].group, "");
        assert_eq!(devices[1].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(devices[1].brand, "A100-SXM4-40GB");
        assert_eq!(devices[1].group, "training");

        assert!(parse_inventory("zero, GPU-aaaa, Tesla T4", &config).is_err());
        assert!(parse_inventory("0, GPU-aaaa", &config).is_err());
    }
}
