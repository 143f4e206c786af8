//! 8.3 short names and collision-free generation from long names.

use core::fmt;

use crate::error::{FatError, Result};

const SHORT_NAME_LEN: usize = 11;
const BASE_LEN: usize = 8;
const EXT_LEN: usize = 3;
const MAX_SUFFIX: u32 = 999_999;

/// Eleven space-padded bytes exactly as stored in a directory entry (after the
/// 0x05 escape is undone).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortName([u8; SHORT_NAME_LEN]);

pub fn is_valid_short_char(byte: u8) -> bool {
    byte.is_ascii_uppercase()
        || byte.is_ascii_digit()
        || matches!(
            byte,
            b'_' | b'^' | b'$' | b'~' | b'!' | b'#' | b'%' | b'&' | b'-' | b'{' | b'}' | b'('
                | b')' | b'@' | b'\'' | b'`'
        )
}

impl ShortName {
    pub const DOT: Self = Self(*b".          ");
    pub const DOT_DOT: Self = Self(*b"..         ");

    pub fn from_raw(raw: [u8; SHORT_NAME_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; SHORT_NAME_LEN] {
        &self.0
    }

    /// Parses `name` if it already is a valid 8.3 name, ignoring case.
    /// Returns `None` instead of failing so it doubles as a validity probe.
    pub fn try_parse(name: &str) -> Option<Self> {
        if name == "." {
            return Some(Self::DOT);
        }
        if name == ".." {
            return Some(Self::DOT_DOT);
        }
        let (base, ext) = match name.rfind('.') {
            Some(idx) => (&name[..idx], &name[idx + 1..]),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > BASE_LEN || ext.len() > EXT_LEN {
            return None;
        }

        let mut raw = [b' '; SHORT_NAME_LEN];
        for (dst, src) in raw[..BASE_LEN].iter_mut().zip(base.bytes()) {
            let upper = src.to_ascii_uppercase();
            if !is_valid_short_char(upper) {
                return None;
            }
            *dst = upper;
        }
        for (dst, src) in raw[BASE_LEN..].iter_mut().zip(ext.bytes()) {
            let upper = src.to_ascii_uppercase();
            if !is_valid_short_char(upper) {
                return None;
            }
            *dst = upper;
        }
        Some(Self(raw))
    }

    pub fn is_dot_entry(&self) -> bool {
        *self == Self::DOT || *self == Self::DOT_DOT
    }

    pub fn base(&self) -> &[u8] {
        trim_padding(&self.0[..BASE_LEN])
    }

    pub fn extension(&self) -> &[u8] {
        trim_padding(&self.0[BASE_LEN..])
    }

    /// Rotating checksum stored in every long-name fragment of this entry.
    pub fn checksum(&self) -> u8 {
        let mut sum = 0u8;
        for byte in self.0.iter() {
            sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*byte);
        }
        sum
    }

    /// `BASE.EXT` form, or just `BASE` without an extension.
    pub fn as_simple_string(&self) -> heapless::String<12> {
        let mut out = heapless::String::new();
        push_bytes(&mut out, self.base(), false);
        if !self.extension().is_empty() {
            let _ = out.push('.');
            push_bytes(&mut out, self.extension(), false);
        }
        out
    }

    /// Display form honouring the lowercase flags of the entry.
    pub fn display_name(&self, lowercase_base: bool, lowercase_ext: bool) -> heapless::String<12> {
        let mut out = heapless::String::new();
        push_bytes(&mut out, self.base(), lowercase_base);
        if !self.extension().is_empty() {
            let _ = out.push('.');
            push_bytes(&mut out, self.extension(), lowercase_ext);
        }
        out
    }
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
    &bytes[..end]
}

fn push_bytes(out: &mut heapless::String<12>, bytes: &[u8], lowercase: bool) {
    for byte in bytes.iter() {
        let ch = if byte.is_ascii() {
            let b = if lowercase {
                byte.to_ascii_lowercase()
            } else {
                *byte
            };
            b as char
        } else {
            '_'
        };
        let _ = out.push(ch);
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_simple_string())
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({:?})", self.as_simple_string().as_str())
    }
}

/// Result of mapping a long name onto the 8.3 namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneratedName {
    pub short_name: ShortName,
    pub lowercase_base: bool,
    pub lowercase_ext: bool,
}

struct Tidied {
    text: Vec<u8>,
    clean: bool,
    has_lower: bool,
    has_upper: bool,
}

fn tidy(part: &str) -> Tidied {
    let mut out = Tidied {
        text: Vec::with_capacity(part.len()),
        clean: true,
        has_lower: false,
        has_upper: false,
    };
    for ch in part.chars() {
        if ch == '.' || ch == ' ' {
            out.clean = false;
            continue;
        }
        if ch.is_ascii_lowercase() {
            out.has_lower = true;
        } else if ch.is_ascii_uppercase() {
            out.has_upper = true;
        }
        let upper = if ch.is_ascii() {
            ch.to_ascii_uppercase() as u8
        } else {
            0
        };
        if is_valid_short_char(upper) {
            out.text.push(upper);
        } else {
            out.text.push(b'_');
            out.clean = false;
        }
    }
    out
}

/// Derives a short name for `long_name` that `is_used` does not report as
/// taken.
///
/// A `~N` suffix is only appended when the long name does not fit 8.3, needed
/// character substitution, or collides; otherwise the long name's all-lower
/// casing is kept through the lowercase flags.
pub fn generate_short_name(
    long_name: &str,
    is_used: impl Fn(&ShortName) -> bool,
) -> Result<GeneratedName> {
    let trimmed = long_name.trim_start_matches('.');
    let (base_raw, ext_raw) = match trimmed.rfind('.') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => (trimmed, ""),
    };

    let base = tidy(base_raw);
    let mut ext = tidy(ext_raw);
    if base.text.is_empty() && ext.text.is_empty() {
        return Err(FatError::NameGenerationFailure);
    }
    if ext.text.len() > EXT_LEN {
        ext.text.truncate(EXT_LEN);
        ext.clean = false;
    }

    let fits = !base.text.is_empty() && base.text.len() <= BASE_LEN;
    if fits && base.clean && ext.clean {
        let candidate = compose(&base.text, &ext.text);
        if !is_used(&candidate) {
            return Ok(GeneratedName {
                short_name: candidate,
                lowercase_base: base.has_lower && !base.has_upper,
                lowercase_ext: ext.has_lower && !ext.has_upper,
            });
        }
    }

    for serial in 1..=MAX_SUFFIX {
        let suffix = format!("~{serial}");
        let keep = base.text.len().min(BASE_LEN - suffix.len());
        let mut name = base.text[..keep].to_vec();
        name.extend_from_slice(suffix.as_bytes());
        let candidate = compose(&name, &ext.text);
        if !is_used(&candidate) {
            return Ok(GeneratedName {
                short_name: candidate,
                lowercase_base: false,
                lowercase_ext: false,
            });
        }
    }

    Err(FatError::NameGenerationFailure)
}

fn compose(base: &[u8], ext: &[u8]) -> ShortName {
    let mut raw = [b' '; SHORT_NAME_LEN];
    raw[..base.len()].copy_from_slice(base);
    raw[BASE_LEN..BASE_LEN + ext.len()].copy_from_slice(ext);
    ShortName(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, collections::HashSet};

    fn generate(name: &str, used: &HashSet<String>) -> ShortName {
        generate_short_name(name, |candidate| {
            used.contains(&candidate.as_simple_string().to_lowercase())
        })
        .unwrap()
        .short_name
    }

    #[test]
    fn long_mixed_name_gets_a_suffix() {
        let used = HashSet::new();
        assert_eq!(
            generate("TextFile1.Mine.txt", &used).as_simple_string(),
            "TEXTFI~1.TXT"
        );
    }

    #[test]
    fn plain_name_keeps_its_case_in_flags() {
        let generated = generate_short_name("foo.txt", |_| false).unwrap();
        assert_eq!(generated.short_name.as_simple_string(), "FOO.TXT");
        assert!(generated.lowercase_base);
        assert!(generated.lowercase_ext);
        assert_eq!(generated.short_name.display_name(true, true), "foo.txt");
    }

    #[test]
    fn collision_moves_to_next_serial() {
        let mut used = HashSet::new();
        used.insert("foo.txt".to_string());
        assert_eq!(generate("foo.txt", &used).as_simple_string(), "FOO~1.TXT");
        used.insert("foo~1.txt".to_string());
        assert_eq!(generate("foo.txt", &used).as_simple_string(), "FOO~2.TXT");
    }

    #[test]
    fn substitution_forces_a_suffix() {
        let used = HashSet::new();
        assert_eq!(generate("a+b.c", &used).as_simple_string(), "A_B~1.C");
        assert_eq!(generate("my file.txt", &used).as_simple_string(), "MYFILE~1.TXT");
        assert_eq!(generate(".profile", &used).as_simple_string(), "PROFILE");
        assert_eq!(generate("archive.tar.gz", &used).as_simple_string(), "ARCHIV~1.GZ");
    }

    #[test]
    fn serial_width_eats_into_the_base() {
        let mut used = HashSet::new();
        for n in 1..=9 {
            used.insert(format!("longna~{n}.txt"));
        }
        assert_eq!(
            generate("LongNameHere.txt", &used).as_simple_string(),
            "LONGN~10.TXT"
        );
    }

    #[test]
    fn nothing_left_after_tidying_fails() {
        assert!(matches!(
            generate_short_name("...", |_| false),
            Err(FatError::NameGenerationFailure)
        ));
    }

    #[test]
    fn exhausted_suffixes_fail() {
        let tried = Cell::new(0u32);
        let last = Cell::new(None);
        let result = generate_short_name("LongNameHere.txt", |candidate| {
            tried.set(tried.get() + 1);
            last.set(Some(*candidate));
            true
        });
        assert!(matches!(result, Err(FatError::NameGenerationFailure)));
        assert_eq!(tried.get(), MAX_SUFFIX);
        assert_eq!(last.get().unwrap().as_simple_string(), "L~999999.TXT");
    }

    #[test]
    fn generated_names_are_unique_and_valid() {
        let mut used = HashSet::new();
        for n in 0..40 {
            let long = format!("Quarterly Report {n}.xlsx");
            let short = generate(&long, &used);
            assert!(short
                .as_bytes()
                .iter()
                .all(|b| *b == b' ' || is_valid_short_char(*b)));
            assert!(used.insert(short.as_simple_string().to_lowercase()));
        }
    }

    #[test]
    fn try_parse_accepts_only_8_3() {
        assert_eq!(
            ShortName::try_parse("readme.md").unwrap().as_bytes(),
            b"README  MD "
        );
        assert_eq!(ShortName::try_parse("..").unwrap(), ShortName::DOT_DOT);
        assert!(ShortName::try_parse("toolongname.txt").is_none());
        assert!(ShortName::try_parse("a.text").is_none());
        assert!(ShortName::try_parse("a b.txt").is_none());
        assert!(ShortName::try_parse(".txt").is_none());
    }

    #[test]
    fn checksum_matches_known_value() {
        let name = ShortName::from_raw(*b"FOO     TXT");
        let mut sum = 0u8;
        for byte in b"FOO     TXT" {
            sum = sum.rotate_right(1).wrapping_add(*byte);
        }
        assert_eq!(name.checksum(), sum);
    }
}
