//! Property-based test generators using proptest.
//!
//! Provides strategies for generating names that follow (or violate) the
//! WAL and backup naming grammars.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

/// Strategy for generating 24 character segment names.
pub fn segment_name_strategy() -> impl Strategy<Value = String> {
    (1u32..0x100, any::<u64>())
        .prop_map(|(timeline, counter)| format!("{timeline:08X}{counter:016X}"))
}

/// Strategy for generating history file names.
pub fn history_name_strategy() -> impl Strategy<Value = String> {
    (1u32..0x100).prop_map(|timeline| format!("{timeline:08X}.history"))
}

/// Strategy for generating backup label names.
pub fn label_name_strategy() -> impl Strategy<Value = String> {
    (segment_name_strategy(), any::<u32>())
        .prop_map(|(segment, offset)| format!("{segment}.{offset:08X}.backup"))
}

/// Strategy for generating stored-object extensions, possibly empty.
pub fn extension_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just(".zst".to_string()),
        Just(".gz".to_string()),
        Just(".lz4.gpg".to_string()),
        prop::string::string_regex("\\.[a-z]{1,5}").expect("Invalid regex"),
    ]
}

/// Strategy for generating any valid WAL archive name with extension.
pub fn wal_object_name_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![
            segment_name_strategy(),
            history_name_strategy(),
            label_name_strategy(),
        ],
        extension_strategy(),
    )
        .prop_map(|(name, ext)| format!("{name}{ext}"))
}

/// Strategy for generating names that are not WAL names.
pub fn invalid_wal_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::string::string_regex("[0-9A-F]{0,23}").expect("Invalid regex"),
        prop::string::string_regex("[0-9A-F]{23}[-_ ][0-9A-F]{0,4}").expect("Invalid regex"),
        prop::string::string_regex("[0-9A-F]{24}[a-z]{1,4}").expect("Invalid regex"),
        prop::string::string_regex("[a-z_]{1,12}\\.pid").expect("Invalid regex"),
    ]
}

/// Strategy for generating backup creation times in whole seconds.
pub fn backup_time_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (1_500_000_000i64..2_000_000_000).prop_map(|secs| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

/// Strategy for generating cluster names.
pub fn cluster_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}
