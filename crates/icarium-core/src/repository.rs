//! Repository build configuration and ref matching.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Category of ref a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    #[display("branch")]
    Branch,
    #[display("tag")]
    Tag,
}

impl RuleKind {
    /// The second component of a ref in this category.
    fn ref_category(&self) -> &'static str {
        match self {
            RuleKind::Branch => "heads",
            RuleKind::Tag => "tags",
        }
    }
}

impl std::str::FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "branch" => Ok(RuleKind::Branch),
            "tag" => Ok(RuleKind::Tag),
            _ => Err(Error::InvalidInput(format!("unknown rule type: {}", s))),
        }
    }
}

/// A pushed ref split into the parts rules care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefName<'a> {
    /// `heads` for branches, `tags` for tags.
    pub category: &'a str,
    /// Last path component, e.g. `v1.0` for `refs/tags/v1.0`.
    pub short_name: &'a str,
}

impl<'a> RefName<'a> {
    pub fn parse(git_ref: &'a str) -> Result<Self> {
        let parts: Vec<&str> = git_ref.split('/').collect();
        if parts.len() < 2 {
            return Err(Error::InvalidRef(git_ref.to_string()));
        }

        Ok(Self {
            category: parts[1],
            short_name: parts[parts.len() - 1],
        })
    }
}

/// One configured trigger condition for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRule {
    pub kind: RuleKind,
    /// Literal ref name, or `/regex/` matched against the ref's short name.
    pub name_pattern: String,
    /// Image tag to publish. May be empty for tag rules.
    pub image_tag: String,
    pub dockerfile_location: String,
}

impl BuildRule {
    /// Interior of a `/.../` pattern, if this rule uses one.
    pub fn regex_pattern(&self) -> Option<&str> {
        let p = self.name_pattern.as_str();
        if p.len() >= 2 && p.starts_with('/') && p.ends_with('/') {
            Some(&p[1..p.len() - 1])
        } else {
            None
        }
    }

    /// Whether a push to `git_ref` should trigger this rule.
    ///
    /// The category check runs first, so a tag-shaped name pushed as a branch
    /// never matches a tag rule. Regex patterns are unanchored.
    pub fn matches(&self, git_ref: &str) -> Result<bool> {
        let ref_name = RefName::parse(git_ref)?;

        if ref_name.category != self.kind.ref_category() {
            return Ok(false);
        }

        match self.regex_pattern() {
            Some(pattern) => {
                let re = Regex::new(pattern).map_err(|source| Error::InvalidPattern {
                    pattern: self.name_pattern.clone(),
                    source,
                })?;
                Ok(re.is_match(ref_name.short_name))
            }
            None => Ok(ref_name.short_name == self.name_pattern),
        }
    }

    /// Tag to publish the image under for a push to `ref_name`.
    ///
    /// Tag rules without an explicit image tag reuse the pushed tag's name.
    pub fn effective_image_tag(&self, ref_name: &RefName<'_>) -> Result<String> {
        if !self.image_tag.is_empty() {
            return Ok(self.image_tag.clone());
        }

        match self.kind {
            RuleKind::Tag => Ok(ref_name.short_name.to_string()),
            RuleKind::Branch => Err(Error::InvalidInput(format!(
                "branch rule '{}' has no image tag configured",
                self.name_pattern
            ))),
        }
    }
}

/// Build configuration for one source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub repository_full_name: String,
    /// Identity whose credential is used for checkout.
    pub owner_username: String,
    /// Evaluated in order; the first match wins.
    pub build_rules: Vec<BuildRule>,
}

impl RepositoryConfig {
    /// First rule matching `git_ref`, or `None` if the push triggers nothing.
    pub fn find_matching_rule(&self, git_ref: &str) -> Result<Option<&BuildRule>> {
        for rule in &self.build_rules {
            if rule.matches(git_ref)? {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(kind: RuleKind, pattern: &str, tag: &str) -> BuildRule {
        BuildRule {
            kind,
            name_pattern: pattern.to_string(),
            image_tag: tag.to_string(),
            dockerfile_location: String::new(),
        }
    }

    #[test]
    fn test_short_refs_are_errors() {
        let r = rule(RuleKind::Branch, "main", "latest");
        assert!(matches!(r.matches("main"), Err(Error::InvalidRef(_))));
        assert!(matches!(r.matches(""), Err(Error::InvalidRef(_))));
    }

    #[test]
    fn test_branch_literal() {
        let r = rule(RuleKind::Branch, "main", "latest");
        assert!(r.matches("refs/heads/main").unwrap());
        assert!(!r.matches("refs/tags/main").unwrap());
        assert!(!r.matches("refs/heads/develop").unwrap());
    }

    #[test]
    fn test_branch_uses_last_component() {
        let r = rule(RuleKind::Branch, "login", "dev");
        assert!(r.matches("refs/heads/feature/login").unwrap());
    }

    #[test]
    fn test_tag_regex() {
        let r = rule(RuleKind::Tag, r"/^v\d+\.\d+\.\d+$/", "");
        assert!(r.matches("refs/tags/v1.2.3").unwrap());
        assert!(!r.matches("refs/tags/v1.2").unwrap());
        assert!(!r.matches("refs/heads/v1.2.3").unwrap());
    }

    #[test]
    fn test_regex_is_unanchored() {
        let r = rule(RuleKind::Tag, "/rc/", "");
        assert!(r.matches("refs/tags/v1.0-rc1").unwrap());
    }

    #[test]
    fn test_branch_regex() {
        let r = rule(RuleKind::Branch, "/^release-/", "release");
        assert!(r.matches("refs/heads/release-2024").unwrap());
        assert!(!r.matches("refs/heads/main").unwrap());
    }

    #[test]
    fn test_malformed_regex_is_error() {
        let r = rule(RuleKind::Tag, "/v(/", "");
        assert!(matches!(
            r.matches("refs/tags/v1"),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_malformed_regex_not_evaluated_on_category_mismatch() {
        let r = rule(RuleKind::Tag, "/v(/", "");
        assert!(!r.matches("refs/heads/v1").unwrap());
    }

    #[test]
    fn test_single_slash_is_literal() {
        let r = rule(RuleKind::Tag, "/", "");
        assert_eq!(r.regex_pattern(), None);
        assert!(!r.matches("refs/tags/v1").unwrap());
    }

    #[test]
    fn test_first_match_wins() {
        let config = RepositoryConfig {
            repository_full_name: "acme/widget".to_string(),
            owner_username: "acme".to_string(),
            build_rules: vec![
                rule(RuleKind::Branch, "develop", "dev"),
                rule(RuleKind::Branch, "main", "latest"),
                rule(RuleKind::Branch, "/ma/", "other"),
            ],
        };

        let found = config.find_matching_rule("refs/heads/main").unwrap().unwrap();
        assert_eq!(found.image_tag, "latest");
    }

    #[test]
    fn test_no_match_is_none() {
        let config = RepositoryConfig {
            repository_full_name: "acme/widget".to_string(),
            owner_username: "acme".to_string(),
            build_rules: vec![rule(RuleKind::Tag, "v1", "")],
        };
        assert!(config.find_matching_rule("refs/heads/main").unwrap().is_none());
    }

    #[test]
    fn test_effective_image_tag() {
        let ref_name = RefName::parse("refs/tags/v2.0.0").unwrap();

        let explicit = rule(RuleKind::Tag, "v2.0.0", "stable");
        assert_eq!(explicit.effective_image_tag(&ref_name).unwrap(), "stable");

        let derived = rule(RuleKind::Tag, "v2.0.0", "");
        assert_eq!(derived.effective_image_tag(&ref_name).unwrap(), "v2.0.0");

        let branch_ref = RefName::parse("refs/heads/main").unwrap();
        let branch = rule(RuleKind::Branch, "main", "");
        assert!(branch.effective_image_tag(&branch_ref).is_err());
    }

    #[test]
    fn test_rule_kind_from_str() {
        assert_eq!("tag".parse::<RuleKind>().unwrap(), RuleKind::Tag);
        assert_eq!("branch".parse::<RuleKind>().unwrap(), RuleKind::Branch);
        assert!("commit".parse::<RuleKind>().is_err());
        assert_eq!(RuleKind::Tag.to_string(), "tag");
    }
}
