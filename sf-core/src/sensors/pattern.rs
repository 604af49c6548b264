//! Glob patterns selecting sensors by name
//!
//! `*` matches any run, `?` one character, `[...]` a character class
//! (`[!...]` negated). Matching is anchored and case-sensitive.

use regex::Regex;

use sf_error::{Result, SuperfanError};

#[derive(Debug, Clone)]
pub struct SensorPattern {
    pattern: String,
    regex: Regex,
}

impl SensorPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut re = String::from("^");
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '[' => {
                    let mut class = String::new();
                    let mut closed = false;
                    for (i, inner) in chars.by_ref().enumerate() {
                        match inner {
                            ']' if i > 0 => {
                                closed = true;
                                break;
                            }
                            '!' if i == 0 => class.push('^'),
                            '\\' | '[' => {
                                class.push('\\');
                                class.push(inner);
                            }
                            other => class.push(other),
                        }
                    }
                    if !closed {
                        return Err(SuperfanError::invalid_config(
                            "sensor pattern",
                            format!("unclosed '[' in {:?}", pattern),
                        ));
                    }
                    re.push('[');
                    re.push_str(&class);
                    re.push(']');
                }
                other => re.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| {
            SuperfanError::invalid_config("sensor pattern", format!("{:?}: {}", pattern, e))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Compile a list of patterns
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<SensorPattern>> {
    patterns.iter().map(|p| SensorPattern::new(p)).collect()
}

pub fn matches_any(patterns: &[SensorPattern], name: &str) -> bool {
    patterns.iter().any(|p| p.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_anchoring() {
        let p = SensorPattern::new("CPU* Temp").unwrap();
        assert!(p.matches("CPU1 Temp"));
        assert!(p.matches("CPU Temp"));
        assert!(!p.matches("CPU1 Temp Max"));
        assert!(!p.matches("PCH CPU1 Temp"));
    }

    #[test]
    fn test_case_sensitive() {
        let p = SensorPattern::new("NVMe_*").unwrap();
        assert!(p.matches("NVMe_nvme0n1"));
        assert!(!p.matches("nvme_nvme0n1"));
    }

    #[test]
    fn test_regex_metacharacters_literal() {
        let p = SensorPattern::new("P1-DIMM(A)+").unwrap();
        assert!(p.matches("P1-DIMM(A)+"));
        assert!(!p.matches("P1-DIMMAA"));
    }

    #[test]
    fn test_character_class() {
        let p = SensorPattern::new("FAN[0-9]*").unwrap();
        assert!(p.matches("FAN1"));
        assert!(p.matches("FAN10"));
        assert!(!p.matches("FANA"));

        let negated = SensorPattern::new("FAN[!0-9]").unwrap();
        assert!(negated.matches("FANB"));
        assert!(!negated.matches("FAN2"));

        assert!(SensorPattern::new("FAN[0-9").is_err());
    }

    #[test]
    fn test_question_mark() {
        let p = SensorPattern::new("FAN?").unwrap();
        assert!(p.matches("FANA"));
        assert!(!p.matches("FAN10"));
    }

    #[test]
    fn test_sensor_in_several_zones() {
        let chassis = compile_patterns(&["*Temp".to_string()]).unwrap();
        let cpu = compile_patterns(&["CPU*".to_string()]).unwrap();
        assert!(matches_any(&chassis, "CPU1 Temp"));
        assert!(matches_any(&cpu, "CPU1 Temp"));
    }
}
