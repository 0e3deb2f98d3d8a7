// scenario.rs - Named setting substitution in engine scenario files
//
// Scenario files belong to the external engine. The only thing relied on
// here is that a setting appears as
//   <Setting> ... <Name>NAME</Name> ... <Value>VALUE</Value> ... </Setting>
// and that replacing VALUE is all it takes to reconfigure it.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};
use crate::types::Feature;

/// Setting names the generated scenarios expose
pub mod settings {
    pub const CHANNEL_NAMES: &str = "ChannelNames";
    pub const AUTO_REGRESSIVE_ORDER: &str = "AutoRegressiveOrder";
    pub const PSD_SIZE: &str = "PsdSize";
    pub const SIGNAL_FILE: &str = "SignalFile";
    pub const OUTPUT_CLASS1: &str = "OutputSpectrum1";
    pub const OUTPUT_CLASS2: &str = "OutputSpectrum2";
    pub const OUTPUT_BASELINE1: &str = "OutputBaseline1";
    pub const OUTPUT_BASELINE2: &str = "OutputBaseline2";
    pub const OUTPUT_TRIALS: &str = "OutputTrials";
    pub const METADATA_FILE: &str = "MetadataFile";
    pub const TRAINING_FILE: &str = "TrainingFile";
    pub const WEIGHTS_FILE: &str = "ClassifierWeights";
    pub const PARTITIONS: &str = "KFoldPartitions";
    pub const FEATURE_COUNT: &str = "FeatureCount";
    pub const FEATURE_CHANNELS: &str = "FeatureChannels";
    pub const FEATURE_FREQUENCIES: &str = "FeatureFrequencies";
}

/// An engine scenario held in memory
#[derive(Debug, Clone)]
pub struct Scenario {
    path: PathBuf,
    text: String,
}

impl Scenario {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
        })
    }

    /// Copy a template scenario to `dest` and open the copy
    pub fn from_template(template: &Path, dest: &Path) -> PipelineResult<Self> {
        log::debug!("Copying scenario {:?} to {:?}", template, dest);
        fs::copy(template, dest)?;
        Self::load(dest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the value of every setting named `name`
    ///
    /// Returns `false` (and changes nothing) when no such setting exists.
    pub fn set_setting(&mut self, name: &str, value: &str) -> bool {
        let name_tag = format!("<Name>{}</Name>", escape(name));
        let value = escape(value);

        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        let mut replaced = false;

        while let Some(pos) = rest.find(&name_tag) {
            let after_name = pos + name_tag.len();
            out.push_str(&rest[..after_name]);
            rest = &rest[after_name..];

            // the value must belong to the same <Setting> block
            let setting_end = rest.find("</Setting>").unwrap_or(rest.len());
            let value_open = rest[..setting_end].find("<Value>");
            let value_close = rest[..setting_end].find("</Value>");
            if let (Some(open), Some(close)) = (value_open, value_close) {
                if open < close {
                    let start = open + "<Value>".len();
                    out.push_str(&rest[..start]);
                    out.push_str(&value);
                    rest = &rest[close..];
                    replaced = true;
                }
            }
        }
        out.push_str(rest);

        if replaced {
            self.text = out;
        } else {
            log::debug!("{:?}: no setting named {}", self.path, name);
        }
        replaced
    }

    /// Current value of the first setting named `name`
    pub fn setting(&self, name: &str) -> Option<String> {
        let name_tag = format!("<Name>{}</Name>", escape(name));
        let pos = self.text.find(&name_tag)? + name_tag.len();
        let rest = &self.text[pos..];
        let setting_end = rest.find("</Setting>").unwrap_or(rest.len());
        let block = &rest[..setting_end];
        let start = block.find("<Value>")? + "<Value>".len();
        let end = block[start..].find("</Value>")? + start;
        Some(unescape(&block[start..end]))
    }

    /// Apply several settings, returning how many names were found
    pub fn apply_settings<K, V>(&mut self, pairs: &[(K, V)]) -> usize
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        pairs
            .iter()
            .filter(|(k, v)| self.set_setting(k.as_ref(), v.as_ref()))
            .count()
    }

    /// Write the selected features as three settings
    pub fn set_features(&mut self, features: &[Feature]) -> bool {
        let channels: Vec<&str> = features.iter().map(|f| f.channel.as_str()).collect();
        let freqs: Vec<String> = features.iter().map(|f| f.frequency.to_string()).collect();
        let a = self.set_setting(settings::FEATURE_COUNT, &features.len().to_string());
        let b = self.set_setting(settings::FEATURE_CHANNELS, &channels.join(";"));
        let c = self.set_setting(settings::FEATURE_FREQUENCIES, &freqs.join(";"));
        a || b || c
    }

    pub fn save(&self) -> PipelineResult<()> {
        fs::write(&self.path, &self.text)?;
        Ok(())
    }
}

/// Open a scenario, failing with a format error when it has no settings at all
pub fn load_checked(path: &Path) -> PipelineResult<Scenario> {
    let scenario = Scenario::load(path)?;
    if !scenario.text.contains("<Setting>") {
        return Err(PipelineError::format(path, "no <Setting> blocks"));
    }
    Ok(scenario)
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::FrequencySpec;
    use tempfile::TempDir;

    impl Scenario {
        pub(crate) fn text(&self) -> &str {
            &self.text
        }
    }

    /// Minimal scenario with the given (name, value) settings
    pub(crate) fn scenario_xml(pairs: &[(&str, &str)]) -> String {
        let mut xml = String::from("<OpenViBE-Scenario>\n  <Settings>\n");
        for (name, value) in pairs {
            xml.push_str(&format!(
                "    <Setting>\n      <Identifier>(0x1, 0x2)</Identifier>\n      <Name>{}</Name>\n      <DefaultValue>0</DefaultValue>\n      <Value>{}</Value>\n    </Setting>\n",
                name, value
            ));
        }
        xml.push_str("  </Settings>\n</OpenViBE-Scenario>\n");
        xml
    }

    #[test]
    fn test_set_known_setting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sc2-extract.xml");
        fs::write(&path, scenario_xml(&[("TrialNb", "20"), ("Class1", "LEFT")])).unwrap();

        let mut scen = Scenario::load(&path).unwrap();
        assert!(scen.set_setting("TrialNb", "40"));
        scen.save().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("<Name>TrialNb</Name>\n      <DefaultValue>0</DefaultValue>\n      <Value>40</Value>"));
        assert!(text.contains("<Value>LEFT</Value>"));
    }

    #[test]
    fn test_unknown_setting_is_noop() {
        let xml = scenario_xml(&[("TrialNb", "20")]);
        let mut scen = Scenario {
            path: PathBuf::from("x.xml"),
            text: xml.clone(),
        };
        assert!(!scen.set_setting("Missing", "1"));
        assert_eq!(scen.text(), xml);
    }

    #[test]
    fn test_value_is_escaped_and_scoped_to_setting() {
        // the first setting has no <Value>; the next setting's value must not be touched
        let xml = "<Setting><Name>A</Name></Setting><Setting><Name>B</Name><Value>1</Value></Setting>";
        let mut scen = Scenario {
            path: PathBuf::from("x.xml"),
            text: xml.to_string(),
        };
        assert!(!scen.set_setting("A", "2"));
        assert!(scen.set_setting("B", "a<b"));
        assert!(scen.text().contains("<Value>a&lt;b</Value>"));
        assert_eq!(scen.setting("B").as_deref(), Some("a<b"));
        assert_eq!(scen.setting("A"), None);
    }

    #[test]
    fn test_apply_settings_and_features() {
        let xml = scenario_xml(&[
            (settings::FEATURE_COUNT, "0"),
            (settings::FEATURE_CHANNELS, ""),
            (settings::FEATURE_FREQUENCIES, ""),
            ("Class1", "x"),
        ]);
        let mut scen = Scenario {
            path: PathBuf::from("x.xml"),
            text: xml,
        };
        let applied = scen.apply_settings(&[("Class1", "LEFT"), ("Nope", "1")]);
        assert_eq!(applied, 1);

        let feats = vec![
            Feature { channel: "C3".into(), frequency: FrequencySpec::Range(8, 12) },
            Feature { channel: "Cz".into(), frequency: FrequencySpec::Single(22) },
        ];
        assert!(scen.set_features(&feats));
        assert!(scen.text().contains("<Value>C3;Cz</Value>"));
        assert!(scen.text().contains("<Value>8:12;22</Value>"));
        assert!(scen.text().contains("<Value>2</Value>"));
    }
}
