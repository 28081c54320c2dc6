//! Wheels encode the Python interpreter, ABI, and platform that they support in their filenames
//! using platform compatibility tags. This module provides support for describing the tags the
//! target interpreter supports and determining if a wheel is compatible with a set of tags.

use indexmap::IndexSet;
use itertools::Itertools;
use pep508_rs::MarkerEnvironment;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// A representation of a tag triple for a wheel.
#[derive(Debug, Clone, Hash, Eq, PartialEq, SerializeDisplay, DeserializeFromStr)]
pub struct WheelTag {
    /// The interpreter name, e.g. "py"
    pub interpreter: String,

    /// The ABI that a wheel supports, e.g. "cp37m"
    pub abi: String,

    /// The OS/platform the wheel supports, e.g. "win_amd64".
    pub platform: String,
}

impl FromStr for WheelTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((interpreter, abi, platform)) =
            s.split('-').map(ToOwned::to_owned).collect_tuple()
        else {
            return Err(String::from("not enough '-' separators"));
        };
        Ok(Self {
            interpreter,
            abi,
            platform,
        })
    }
}

impl Display for WheelTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", &self.interpreter, &self.abi, &self.platform)
    }
}

/// Contains an ordered set of platform tags with which compatibility of wheels can be determined.
#[derive(Debug, Clone)]
pub struct WheelTags {
    tags: IndexSet<WheelTag>,
}

impl WheelTags {
    /// Returns an iterator over the supported tags.
    pub fn tags(&self) -> impl Iterator<Item = &'_ WheelTag> + '_ {
        self.tags.iter()
    }

    /// Determines the compatibility of the specified tag with the tags in this instance. Returns
    /// `None` if the specified tag is not compatible with any of the tags in this instance. Returns
    /// `Some(i)` where `i` indicates the compatibility level. The higher the number the more
    /// specific the tag is to the platform. The wheel artifact with the highest number should be
    /// preferred over others.
    pub fn compatibility(&self, tag: &WheelTag) -> Option<i32> {
        self.tags.get_index_of(tag).map(|score| -(score as i32))
    }

    /// Returns if the specified tag is compatible with this set.
    pub fn is_compatible(&self, tag: &WheelTag) -> bool {
        self.tags.contains(tag)
    }

    /// Derives a tag set for the interpreter described by the given marker environment.
    ///
    /// This covers CPython with the common platform spellings (manylinux for linux, universal2
    /// for macOS). It intentionally does not enumerate every historical manylinux alias.
    pub fn from_env_markers(env: &MarkerEnvironment) -> Self {
        let release = &env.python_full_version.version.release;
        let major = release.first().copied().unwrap_or(3);
        let minor = release.get(1).copied().unwrap_or(0);

        let platforms = platform_tags(env);
        let mut tags = Vec::new();

        // Interpreter specific tags, most specific first.
        for platform in &platforms {
            tags.push(format!("cp{major}{minor}-cp{major}{minor}-{platform}"));
            for abi3_minor in (2..=minor).rev() {
                tags.push(format!("cp{major}{abi3_minor}-abi3-{platform}"));
            }
            tags.push(format!("cp{major}{minor}-none-{platform}"));
        }

        // Pure python tags.
        for platform in platforms.iter().map(String::as_str).chain(["any"]) {
            for py_minor in (0..=minor).rev() {
                tags.push(format!("py{major}{py_minor}-none-{platform}"));
            }
            tags.push(format!("py{major}-none-{platform}"));
        }

        tags.iter()
            .map(|s| WheelTag::from_str(s).expect("generated tags are well formed"))
            .collect()
    }
}

/// Returns the platform tags for the target system, most specific first.
fn platform_tags(env: &MarkerEnvironment) -> Vec<String> {
    let machine = env.platform_machine.as_str();
    match env.sys_platform.as_str() {
        "linux" => vec![
            format!("manylinux_2_17_{machine}"),
            format!("manylinux2014_{machine}"),
            format!("manylinux_2_12_{machine}"),
            format!("manylinux2010_{machine}"),
            format!("manylinux_2_5_{machine}"),
            format!("manylinux1_{machine}"),
            format!("linux_{machine}"),
        ],
        "darwin" => vec![
            format!("macosx_11_0_{machine}"),
            String::from("macosx_11_0_universal2"),
            format!("macosx_10_9_{machine}"),
            String::from("macosx_10_9_universal2"),
        ],
        "win32" => match machine {
            "AMD64" => vec![String::from("win_amd64")],
            "ARM64" => vec![String::from("win_arm64")],
            _ => vec![String::from("win32")],
        },
        other => vec![format!("{}_{}", other, machine)],
    }
}

impl FromIterator<WheelTag> for WheelTags {
    fn from_iter<T: IntoIterator<Item = WheelTag>>(iter: T) -> Self {
        Self {
            tags: FromIterator::from_iter(iter),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_str() {
        let tag = WheelTag::from_str("py2-none-any").unwrap();
        assert_eq!(tag.interpreter, "py2");
        assert_eq!(tag.abi, "none");
        assert_eq!(tag.platform, "any");
    }

    #[test]
    fn test_compatibility_prefers_specific_tags() {
        let tags: WheelTags = ["cp310-cp310-win_amd64", "py3-none-any"]
            .iter()
            .map(|s| WheelTag::from_str(s).unwrap())
            .collect();
        let specific = WheelTag::from_str("cp310-cp310-win_amd64").unwrap();
        let pure = WheelTag::from_str("py3-none-any").unwrap();
        assert!(tags.compatibility(&specific) > tags.compatibility(&pure));
        assert!(!tags.is_compatible(&WheelTag::from_str("cp39-cp39-win_amd64").unwrap()));
    }
}
