use super::*;

fn sample() -> Sfo {
    let mut sfo = Sfo::new();

    sfo.set("TITLE", Value::Utf8("T".into()));
    sfo.set("VERSION", Value::Utf8("01.00".into()));
    sfo.set("ATTRIBUTE", Value::Integer(5));
    sfo.set("SHORT", Value::Utf8Special("ab".into()));

    sfo
}

#[test]
fn round_trip_preserves_values() {
    let raw = sample().to_bytes();
    let parsed = Sfo::read(&raw).unwrap();

    assert_eq!(parsed.get("TITLE").unwrap().as_str(), Some("T"));
    assert_eq!(parsed.get("VERSION").unwrap().as_str(), Some("01.00"));
    assert_eq!(parsed.get("ATTRIBUTE").unwrap().as_integer(), Some(5));
    assert_eq!(parsed.get("SHORT").unwrap().as_str(), Some("ab"));
    assert_eq!(parsed.len(), 4);
}

#[test]
fn round_trip_is_byte_exact() {
    let first = sample().to_bytes();
    let second = Sfo::read(&first).unwrap().to_bytes();

    assert_eq!(first, second);
}

#[test]
fn keys_are_sorted_on_write() {
    let raw = sample().to_bytes();
    let parsed = Sfo::read(&raw).unwrap();
    let keys: Vec<&str> = parsed.keys().collect();

    assert_eq!(keys, ["ATTRIBUTE", "SHORT", "TITLE", "VERSION"]);
}

#[test]
fn data_table_is_aligned() {
    let raw = sample().to_bytes();

    assert_eq!(LE::read_u32(&raw[0x0C..]) % 4, 0);
}

#[test]
fn scec_prefix_is_skipped() {
    let inner = sample().to_bytes();
    let mut raw = Vec::new();

    raw.extend_from_slice(b"SCEC");
    raw.resize(0x800, 0);
    raw.extend_from_slice(&inner);

    let parsed = Sfo::read(&raw).unwrap();

    assert_eq!(parsed.get("TITLE").unwrap().as_str(), Some("T"));
}

#[test]
fn magic_is_checked() {
    let mut raw = sample().to_bytes();

    raw[0] ^= 0xff;

    assert!(matches!(Sfo::read(&raw), Err(ReadError::InvalidMagic)));
}

#[test]
fn table_layout_is_checked() {
    let mut raw = sample().to_bytes();

    // Swap the table offsets so the data table precedes the key table.
    let key = LE::read_u32(&raw[0x08..]);
    let data = LE::read_u32(&raw[0x0C..]);

    LE::write_u32(&mut raw[0x08..0x0C], data);
    LE::write_u32(&mut raw[0x0C..0x10], key);

    assert!(matches!(
        Sfo::read(&raw),
        Err(ReadError::InvalidTableLayout)
    ));
}

#[test]
fn remove_drops_the_entry() {
    let mut sfo = sample();

    assert!(sfo.remove("VERSION").is_some());
    assert!(sfo.get("VERSION").is_none());
    assert!(sfo.remove("VERSION").is_none());

    let parsed = Sfo::read(&sfo.to_bytes()).unwrap();

    assert_eq!(parsed.len(), 3);
}

#[test]
fn utf8_values_carry_their_terminator() {
    let raw = sample().to_bytes();
    let data_table = LE::read_u32(&raw[0x0C..]) as usize;

    // First sorted entry is ATTRIBUTE (integer), then SHORT (no NUL),
    // then TITLE which is stored as "T\0".
    let parsed = Sfo::read(&raw).unwrap();

    assert!(matches!(parsed.get("TITLE"), Some(Value::Utf8(_))));
    assert!(data_table > 0);
}

#[test]
fn split_pairs_parses_pubtoolinfo() {
    let info = "c_date=20240102,c_time=030405,sdk_ver=09500001";
    let pairs: Vec<(&str, &str)> = split_pairs(info).collect();

    assert_eq!(
        pairs,
        [
            ("c_date", "20240102"),
            ("c_time", "030405"),
            ("sdk_ver", "09500001"),
        ]
    );
}
