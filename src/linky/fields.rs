use lazy_static::lazy_static;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Timestamp,
    Ignored,
}

/// Static description of one field a meter may report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelField {
    pub label: &'static str,
    pub kind: FieldKind,
    pub scale: f64,
    pub unit: &'static str,
    pub timestamp_channel: Option<&'static str>,
    pub group: &'static str,
    /// Only reported by three phase meters
    pub phase: Option<u8>,
    /// Only meaningful for meters injecting into the grid
    pub producer: bool,
}

impl ChannelField {
    const fn new(label: &'static str, kind: FieldKind, scale: f64, unit: &'static str, group: &'static str) -> Self {
        ChannelField { label, kind, scale, unit, timestamp_channel: None, group, phase: None, producer: false }
    }

    const fn stamped(self, channel: &'static str) -> Self {
        ChannelField { timestamp_channel: Some(channel), ..self }
    }

    const fn on_phase(self, phase: u8) -> Self {
        ChannelField { phase: Some(phase), ..self }
    }

    const fn injection(self) -> Self {
        ChannelField { producer: true, ..self }
    }

    /// Channel name derived from the label, `SMAXSN-1` becomes `smaxsn_prev`
    pub fn channel(&self) -> String {
        channel_name(self.label)
    }
}

pub fn channel_name(label: &str) -> String {
    label
        .to_lowercase()
        .replace("+1", "_next")
        .replace("-1", "_prev")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

const fn text(label: &'static str, group: &'static str) -> ChannelField {
    ChannelField::new(label, FieldKind::Text, 1.0, "", group)
}

const fn int(label: &'static str, unit: &'static str, scale: f64, group: &'static str) -> ChannelField {
    ChannelField::new(label, FieldKind::Integer, scale, unit, group)
}

const fn energy(label: &'static str) -> ChannelField {
    ChannelField::new(label, FieldKind::Integer, 0.001, "kWh", "energy")
}

const fn date(label: &'static str, group: &'static str) -> ChannelField {
    ChannelField::new(label, FieldKind::Timestamp, 1.0, "", group)
}

const fn ignored(label: &'static str) -> ChannelField {
    ChannelField::new(label, FieldKind::Ignored, 1.0, "", "common")
}

pub static FIELDS: &[ChannelField] = &[
    /* Extended ("standard") dialect */
    text("ADSC", "common"),
    text("VTIC", "common"),
    date("DATE", "common"),
    text("NGTF", "tariff"),
    text("LTARF", "tariff"),
    energy("EAST"),
    energy("EASF01"),
    energy("EASF02"),
    energy("EASF03"),
    energy("EASF04"),
    energy("EASF05"),
    energy("EASF06"),
    energy("EASF07"),
    energy("EASF08"),
    energy("EASF09"),
    energy("EASF10"),
    energy("EASD01"),
    energy("EASD02"),
    energy("EASD03"),
    energy("EASD04"),
    energy("EAIT").injection(),
    int("ERQ1", "kVArh", 0.001, "energy"),
    int("ERQ2", "kVArh", 0.001, "energy").injection(),
    int("ERQ3", "kVArh", 0.001, "energy").injection(),
    int("ERQ4", "kVArh", 0.001, "energy"),
    int("IRMS1", "A", 1.0, "current"),
    int("IRMS2", "A", 1.0, "current").on_phase(2),
    int("IRMS3", "A", 1.0, "current").on_phase(3),
    int("URMS1", "V", 1.0, "voltage"),
    int("URMS2", "V", 1.0, "voltage").on_phase(2),
    int("URMS3", "V", 1.0, "voltage").on_phase(3),
    int("PREF", "kVA", 1.0, "power"),
    int("PCOUP", "kVA", 1.0, "power"),
    int("SINSTS", "VA", 1.0, "power"),
    int("SINSTS1", "VA", 1.0, "power").on_phase(1),
    int("SINSTS2", "VA", 1.0, "power").on_phase(2),
    int("SINSTS3", "VA", 1.0, "power").on_phase(3),
    int("SMAXSN", "VA", 1.0, "power").stamped("smaxsn_date"),
    int("SMAXSN1", "VA", 1.0, "power").stamped("smaxsn1_date").on_phase(1),
    int("SMAXSN2", "VA", 1.0, "power").stamped("smaxsn2_date").on_phase(2),
    int("SMAXSN3", "VA", 1.0, "power").stamped("smaxsn3_date").on_phase(3),
    int("SMAXSN-1", "VA", 1.0, "power").stamped("smaxsn_prev_date"),
    int("SMAXSN1-1", "VA", 1.0, "power").stamped("smaxsn1_prev_date").on_phase(1),
    int("SMAXSN2-1", "VA", 1.0, "power").stamped("smaxsn2_prev_date").on_phase(2),
    int("SMAXSN3-1", "VA", 1.0, "power").stamped("smaxsn3_prev_date").on_phase(3),
    int("SINSTI", "VA", 1.0, "producer").injection(),
    int("SMAXIN", "VA", 1.0, "producer").stamped("smaxin_date").injection(),
    int("SMAXIN-1", "VA", 1.0, "producer").stamped("smaxin_prev_date").injection(),
    int("CCASN", "W", 1.0, "power").stamped("ccasn_date"),
    int("CCASN-1", "W", 1.0, "power").stamped("ccasn_prev_date"),
    int("CCAIN", "W", 1.0, "producer").stamped("ccain_date").injection(),
    int("CCAIN-1", "W", 1.0, "producer").stamped("ccain_prev_date").injection(),
    int("UMOY1", "V", 1.0, "voltage").stamped("umoy1_date"),
    int("UMOY2", "V", 1.0, "voltage").stamped("umoy2_date").on_phase(2),
    int("UMOY3", "V", 1.0, "voltage").stamped("umoy3_date").on_phase(3),
    text("STGE", "status"),
    int("DPM1", "", 1.0, "calendar").stamped("dpm1_date"),
    int("FPM1", "", 1.0, "calendar").stamped("fpm1_date"),
    int("DPM2", "", 1.0, "calendar").stamped("dpm2_date"),
    int("FPM2", "", 1.0, "calendar").stamped("fpm2_date"),
    int("DPM3", "", 1.0, "calendar").stamped("dpm3_date"),
    int("FPM3", "", 1.0, "calendar").stamped("fpm3_date"),
    text("MSG1", "common"),
    text("MSG2", "common"),
    text("PRM", "common"),
    text("RELAIS", "relays"),
    int("NTARF", "", 1.0, "tariff"),
    int("NJOURF", "", 1.0, "calendar"),
    int("NJOURF+1", "", 1.0, "calendar"),
    text("PJOURF+1", "calendar"),
    text("PPOINTE", "calendar"),

    /* Legacy ("historique") dialect */
    text("ADCO", "common"),
    text("OPTARIF", "tariff"),
    int("ISOUSC", "A", 1.0, "current"),
    energy("BASE"),
    energy("HCHC"),
    energy("HCHP"),
    energy("EJPHN"),
    energy("EJPHPM"),
    energy("BBRHCJB"),
    energy("BBRHPJB"),
    energy("BBRHCJW"),
    energy("BBRHPJW"),
    energy("BBRHCJR"),
    energy("BBRHPJR"),
    int("PEJP", "min", 1.0, "tariff"),
    text("PTEC", "tariff"),
    text("DEMAIN", "tariff"),
    int("IINST", "A", 1.0, "current"),
    int("IINST1", "A", 1.0, "current").on_phase(1),
    int("IINST2", "A", 1.0, "current").on_phase(2),
    int("IINST3", "A", 1.0, "current").on_phase(3),
    int("ADPS", "A", 1.0, "current"),
    int("ADIR1", "A", 1.0, "current").on_phase(1),
    int("ADIR2", "A", 1.0, "current").on_phase(2),
    int("ADIR3", "A", 1.0, "current").on_phase(3),
    int("IMAX", "A", 1.0, "current"),
    int("IMAX1", "A", 1.0, "current").on_phase(1),
    int("IMAX2", "A", 1.0, "current").on_phase(2),
    int("IMAX3", "A", 1.0, "current").on_phase(3),
    int("PMAX", "W", 1.0, "power").on_phase(3),
    int("PAPP", "VA", 1.0, "power"),
    text("HHPHC", "tariff"),
    text("PPOT", "status").on_phase(3),
    ignored("MOTDETAT"),
];

lazy_static! {
    static ref FIELD_INDEX: HashMap<&'static str, &'static ChannelField> =
        FIELDS.iter().map(|f| (f.label, f)).collect();
}

pub fn lookup(label: &str) -> Option<&'static ChannelField> {
    FIELD_INDEX.get(label).copied()
}
