use crate::{Command, Toggle};
use anyhow::{Context, Result, bail};
use audiohal_engine::address::fourcc_str;
use audiohal_engine::selector::{self, Shape};
use audiohal_engine::{
    AudioHal, ChangeEvent, DeviceId, DeviceSummary, EventCallback, PropertyAddress,
    PropertyValue, Scope,
};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::UNIX_EPOCH;

const DEFAULT_WATCH: &[&str] = &["devices", "default-output", "volume", "mute", "sample-rate"];

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CapabilityView {
    selector: String,
    scope: Scope,
    element: u32,
    settable: bool,
}

#[derive(Serialize)]
struct DescribeView {
    id: DeviceId,
    name: Option<String>,
    capabilities: Vec<CapabilityView>,
}

#[derive(Serialize)]
struct CurrentView {
    output: Option<DeviceId>,
    output_name: Option<String>,
    input: Option<DeviceId>,
    input_name: Option<String>,
}

#[derive(Serialize)]
struct PropertyView<'a> {
    device: DeviceId,
    selector: String,
    scope: Scope,
    element: u32,
    value: &'a PropertyValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
}

#[derive(Serialize)]
struct ChannelsView<'a> {
    device: DeviceId,
    channels: &'a [u32],
}

#[derive(Serialize)]
struct VolumeView {
    device: DeviceId,
    volume: u32,
}

#[derive(Serialize)]
struct MuteView {
    device: DeviceId,
    muted: bool,
}

#[derive(Serialize)]
struct EventView {
    device: DeviceId,
    selector: String,
    scope: Scope,
    element: u32,
    observed_at_ms: u128,
    value: Option<PropertyValue>,
}

fn selector_label(code: u32) -> String {
    selector::name_of(code)
        .map(str::to_owned)
        .unwrap_or_else(|| fourcc_str(code))
}

fn address_label(address: &PropertyAddress) -> String {
    format!(
        "{}/{}/{}",
        selector_label(address.selector),
        address.scope,
        address.element
    )
}

/// Build an address from a selector name or code, falling back to the
/// selector's usual scope.
pub fn parse_address(text: &str, scope: Option<&str>, element: u32) -> Result<PropertyAddress> {
    let code = selector::parse(text).with_context(|| format!("unknown selector {text:?}"))?;
    let scope = match scope {
        Some(name) => Scope::parse(name).with_context(|| format!("unknown scope {name:?}"))?,
        None => selector::lookup(code)
            .map(|info| info.default_scope)
            .unwrap_or(Scope::Global),
    };
    Ok(PropertyAddress::new(code, scope).with_element(element))
}

/// Interpret command-line text in the shape `address` expects.
pub fn parse_value(address: &PropertyAddress, text: &str) -> Result<PropertyValue> {
    let value = match selector::shape_of(address.selector) {
        Shape::U32 => {
            let v: i64 = match text.trim().to_ascii_lowercase().as_str() {
                "on" | "true" => 1,
                "off" | "false" => 0,
                other => other
                    .parse()
                    .with_context(|| format!("{text:?} is not an integer"))?,
            };
            if v < i32::MIN as i64 || v > u32::MAX as i64 {
                bail!("{v} does not fit in 32 bits");
            }
            PropertyValue::Int32(v as u32 as i32)
        }
        Shape::F32 | Shape::F64 => PropertyValue::Float64(
            text.trim()
                .parse()
                .with_context(|| format!("{text:?} is not a number"))?,
        ),
        Shape::Text => PropertyValue::CString(text.to_owned()),
        Shape::ObjectIds => PropertyValue::DeviceIdList(
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().map(DeviceId))
                .collect::<Result<_, _>>()
                .with_context(|| format!("{text:?} is not a list of object IDs"))?,
        ),
        Shape::StreamFormat => PropertyValue::StreamFormat(
            serde_json::from_str(text).context("stream formats are given as JSON")?,
        ),
        Shape::Raw => PropertyValue::RawBytes(parse_hex(text)?),
    };
    Ok(value)
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        bail!("hex payload {text:?} has an odd number of digits");
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .with_context(|| format!("{text:?} is not hex"))
        })
        .collect()
}

fn target(hal: &AudioHal, device: Option<u32>) -> Result<DeviceId> {
    match device {
        Some(id) => Ok(DeviceId(id)),
        None => hal
            .default_output_device()
            .context("no default output device"),
    }
}

fn device_name(hal: &AudioHal, device: DeviceId) -> Option<String> {
    hal.get(device, &selector::NAME_ADDRESS)
        .ok()
        .and_then(|value| value.as_str().map(str::to_owned))
}

fn summary_line(summary: &DeviceSummary) -> String {
    format!(
        "{:>5}  {:<32}  in:{} out:{}  {}",
        summary.id,
        summary.name.as_deref().unwrap_or("Unknown"),
        summary.input_streams,
        summary.output_streams,
        summary.manufacturer.as_deref().unwrap_or("")
    )
}

pub async fn run(hal: &Arc<AudioHal>, command: &Command, out: Output) -> Result<()> {
    match command {
        Command::Devices => {
            let summaries = hal
                .list_devices()?
                .into_iter()
                .map(|id| hal.summary(id))
                .collect::<Result<Vec<_>, _>>()?;
            out.emit(&summaries, || {
                summaries
                    .iter()
                    .map(summary_line)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Command::Count => {
            let count = hal.list_devices()?.len();
            out.emit(&count, || count.to_string())
        }
        Command::Current => {
            let output = hal.default_output_device().ok();
            let input = hal.default_input_device().ok();
            let view = CurrentView {
                output,
                output_name: output.and_then(|id| device_name(hal, id)),
                input,
                input_name: input.and_then(|id| device_name(hal, id)),
            };
            out.emit(&view, || {
                let line = |id: Option<DeviceId>, name: &Option<String>| match id {
                    Some(id) => format!("{id} {}", name.as_deref().unwrap_or("Unknown")),
                    None => "none".to_owned(),
                };
                format!(
                    "output: {}\ninput:  {}",
                    line(view.output, &view.output_name),
                    line(view.input, &view.input_name)
                )
            })
        }
        Command::Describe { device } => {
            let record = hal
                .describe(DeviceId(*device))
                .with_context(|| format!("describing device {device}"))?;
            let mut capabilities: Vec<CapabilityView> = record
                .capabilities
                .iter()
                .map(|(address, settable)| CapabilityView {
                    selector: selector_label(address.selector),
                    scope: address.scope,
                    element: address.element,
                    settable: *settable,
                })
                .collect();
            capabilities.sort_by(|a, b| {
                (&a.selector, a.scope.to_string(), a.element).cmp(&(
                    &b.selector,
                    b.scope.to_string(),
                    b.element,
                ))
            });
            let view = DescribeView {
                id: record.id,
                name: record.name.clone(),
                capabilities,
            };
            out.emit(&view, || {
                let mut lines = vec![format!(
                    "{} {}",
                    view.id,
                    view.name.as_deref().unwrap_or("Unknown")
                )];
                for c in &view.capabilities {
                    lines.push(format!(
                        "  {:<20} {:<12} {:>3}  {}",
                        c.selector,
                        c.scope.to_string(),
                        c.element,
                        if c.settable { "rw" } else { "ro" }
                    ));
                }
                lines.join("\n")
            })
        }
        Command::Get {
            device,
            selector,
            scope,
            element,
        } => {
            let device = DeviceId(*device);
            let address = parse_address(selector, scope.as_deref(), *element)?;
            let label = address_label(&address);
            let reading = hal
                .read(device, &address)
                .with_context(|| format!("reading {label} on device {device}"))?;
            let value = reading.value;
            let view = PropertyView {
                device,
                selector: selector_label(address.selector),
                scope: address.scope,
                element: address.element,
                value: &value,
                bytes: Some(reading.len),
            };
            out.emit(&view, || format!("{label} = {value}"))
        }
        Command::Set {
            device,
            selector,
            value,
            scope,
            element,
        } => {
            let device = DeviceId(*device);
            let address = parse_address(selector, scope.as_deref(), *element)?;
            let value = parse_value(&address, value)?;
            let label = address_label(&address);
            hal.set(device, &address, &value)
                .with_context(|| format!("writing {label} on device {device}"))?;
            let view = PropertyView {
                device,
                selector: selector_label(address.selector),
                scope: address.scope,
                element: address.element,
                value: &value,
                bytes: None,
            };
            out.emit(&view, || format!("{label} <- {value}"))
        }
        Command::Channels { device } => {
            let device = target(hal, *device)?;
            let control = hal.channels(device, Scope::Output)?;
            let view = ChannelsView {
                device,
                channels: control.channels(),
            };
            out.emit(&view, || format!("{:?}", control.channels()))
        }
        Command::Volume { percent, device } => {
            let device = target(hal, *device)?;
            let control = hal.channels(device, Scope::Output)?;
            if let Some(percent) = percent {
                control
                    .set_volume_percent(*percent)
                    .with_context(|| format!("setting volume of device {device}"))?;
            }
            let view = VolumeView {
                device,
                volume: control.volume_percent()?,
            };
            out.emit(&view, || format!("{}%", view.volume))
        }
        Command::Mute { state, device } => {
            let device = target(hal, *device)?;
            let control = hal.channels(device, Scope::Output)?;
            if let Some(state) = state {
                control
                    .set_muted(matches!(state, Toggle::On))
                    .with_context(|| format!("changing mute of device {device}"))?;
            }
            let view = MuteView {
                device,
                muted: control.is_muted()?,
            };
            let state = if view.muted { "muted" } else { "unmuted" };
            out.emit(&view, || state.to_owned())
        }
        Command::Watch { selectors, device } => watch(hal, selectors, *device, out).await,
    }
}

fn owned_by_system(code: u32) -> bool {
    matches!(
        code,
        selector::DEVICES
            | selector::DEFAULT_INPUT_DEVICE
            | selector::DEFAULT_OUTPUT_DEVICE
            | selector::DEFAULT_SYSTEM_OUTPUT_DEVICE
    )
}

fn print_event(hal: &Weak<AudioHal>, event: &ChangeEvent, out: Output) {
    let value = hal
        .upgrade()
        .and_then(|hal| hal.get(event.device, &event.address).ok());
    let view = EventView {
        device: event.device,
        selector: selector_label(event.address.selector),
        scope: event.address.scope,
        element: event.address.element,
        observed_at_ms: event
            .observed_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default(),
        value,
    };
    if out.json {
        match serde_json::to_string(&view) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("unprintable event: {e}"),
        }
    } else {
        let value = view
            .value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_owned());
        println!(
            "[{}] device {} {} = {value}",
            view.observed_at_ms,
            view.device,
            address_label(&event.address)
        );
    }
}

async fn watch(
    hal: &Arc<AudioHal>,
    selectors: &[String],
    device: Option<u32>,
    out: Output,
) -> Result<()> {
    let names: Vec<&str> = if selectors.is_empty() {
        DEFAULT_WATCH.to_vec()
    } else {
        selectors.iter().map(String::as_str).collect()
    };
    let device = target(hal, device)?;
    let weak = Arc::downgrade(hal);
    let callback: EventCallback = Arc::new(move |event: &ChangeEvent| {
        print_event(&weak, event, out);
    });

    for name in names {
        let address = parse_address(name, None, 0)?;
        let object = if owned_by_system(address.selector) {
            DeviceId::SYSTEM
        } else {
            device
        };
        hal.subscribe(object, address, callback.clone())
            .with_context(|| format!("subscribing to {name}"))?;
        tracing::info!("watching {} on object {object}", address_label(&address));
    }
    eprintln!("Watching for changes, press Ctrl+C to stop");

    tokio::select! {
        _ = hal.run_dispatch() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
        }
    }
    hal.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_use_the_selector_default_scope() {
        let address = parse_address("volume", None, 2).unwrap();
        assert_eq!(address, selector::OUTPUT_VOLUME_ADDRESS.with_element(2));
        let address = parse_address("nsrt", Some("input"), 0).unwrap();
        assert_eq!(address.scope, Scope::Input);
        assert!(parse_address("volume", Some("sideways"), 0).is_err());
    }

    #[test]
    fn values_follow_the_selector_shape() {
        let mute = selector::OUTPUT_MUTE_ADDRESS;
        assert_eq!(parse_value(&mute, "on").unwrap(), PropertyValue::Int32(1));
        assert_eq!(
            parse_value(&selector::DEFAULT_OUTPUT_ADDRESS, "4294967295").unwrap(),
            PropertyValue::Int32(-1)
        );
        assert_eq!(
            parse_value(&selector::SAMPLE_RATE_ADDRESS, "44100").unwrap(),
            PropertyValue::Float64(44_100.0)
        );
        assert_eq!(
            parse_value(&selector::DEVICES_ADDRESS, "73, 81").unwrap(),
            PropertyValue::DeviceIdList(vec![DeviceId(73), DeviceId(81)])
        );
        let raw = parse_address("zzzz", Some("global"), 0).unwrap();
        assert_eq!(
            parse_value(&raw, "00ff10").unwrap(),
            PropertyValue::RawBytes(vec![0x00, 0xff, 0x10])
        );
        assert!(parse_value(&raw, "0f0").is_err());
        assert!(parse_value(&mute, "loud").is_err());
    }

    #[tokio::test]
    async fn volume_command_sets_every_channel() {
        let hal = Arc::new(AudioHal::simulated(Default::default()));
        let out = Output { json: true };
        run(
            &hal,
            &Command::Volume {
                percent: Some(30),
                device: None,
            },
            out,
        )
        .await
        .unwrap();
        let control = hal.channels(DeviceId(73), Scope::Output).unwrap();
        assert_eq!(control.volume_percent().unwrap(), 30);
    }
}
