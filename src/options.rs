use log::warn;
use once_cell::sync::OnceCell;

// Runtime options, read once from the environment as `BITSLAB_<NAME>`
// (e.g. `BITSLAB_VERBOSE=1`). Boolean-ish and integer values accepted.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabOption {
    /// Log expand/publish/reclaim events at debug level.
    Verbose,
    /// Print the stat table when an instance is dropped.
    ShowStats,
    /// Return reclaimed pages' physical backing to the OS.
    PageReset,
    /// Unlock a page whose drain attempt failed instead of leaving it
    /// stranded until a later drain succeeds.
    DrainUnlock,
}

struct OptionDesc {
    default_value: i64,
    name: &'static str,
    value: OnceCell<i64>,
}

static OPTIONS: [OptionDesc; 4] = [
    OptionDesc {
        default_value: 0,
        name: "verbose",
        value: OnceCell::new(),
    },
    OptionDesc {
        default_value: 0,
        name: "show_stats",
        value: OnceCell::new(),
    },
    OptionDesc {
        default_value: 1,
        name: "page_reset",
        value: OnceCell::new(),
    },
    OptionDesc {
        default_value: 1,
        name: "drain_unlock",
        value: OnceCell::new(),
    },
];

pub fn option_get(option: SlabOption) -> i64 {
    let desc = &OPTIONS[option as usize];
    *desc.value.get_or_init(|| option_init(desc))
}

#[inline]
pub fn option_is_enabled(option: SlabOption) -> bool {
    option_get(option) != 0
}

fn option_init(desc: &OptionDesc) -> i64 {
    let key = format!("BITSLAB_{}", desc.name.to_uppercase());
    match std::env::var(&key) {
        Ok(raw) => match parse_value(&raw) {
            Some(value) => value,
            None => {
                warn!("invalid value for {}: {:?}, using default", key, raw);
                desc.default_value
            }
        },
        Err(_) => desc.default_value,
    }
}

fn parse_value(raw: &str) -> Option<i64> {
    let s = raw.trim().to_lowercase();
    match s.as_str() {
        "" | "1" | "true" | "on" | "yes" => Some(1),
        "0" | "false" | "off" | "no" => Some(0),
        _ => s.parse::<i64>().ok(),
    }
}
