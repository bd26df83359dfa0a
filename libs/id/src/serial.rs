//! Serial suffix handling for task instance names.

/// Splits a trailing `-<digits>` serial off an instance name.
///
/// Names without a numeric suffix are returned whole with `None`.
pub fn split_serial(name: &str) -> (&str, Option<u64>) {
    if let Some((base, digits)) = name.rsplit_once('-') {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(serial) = digits.parse::<u64>() {
                return (base, Some(serial));
            }
        }
    }
    (name, None)
}

/// Returns the task type name of an instance name.
pub fn strip_serial(name: &str) -> &str {
    split_serial(name).0
}

/// Returns the serial of an instance name, if it has one.
pub fn serial_of(name: &str) -> Option<u64> {
    split_serial(name).1
}

/// Builds the instance name for serial `serial` of `type_name`.
pub fn with_serial(type_name: &str, serial: u64) -> String {
    format!("{}-{}", type_name, serial)
}

/// Name reported to the resource manager for an instance.
///
/// The first `/` becomes `_`. With serial numbering disabled the serial is
/// dropped so every instance of a type shares one name.
pub fn launch_name(name: &str, serial_numbered: bool) -> String {
    let sanitized = name.replacen('/', "_", 1);
    if serial_numbered {
        sanitized
    } else {
        strip_serial(&sanitized).to_string()
    }
}
