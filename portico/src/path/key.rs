use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// An immutable hierarchical key: an ordered sequence of string
/// components plus a wildcard flag.
///
/// Keys share their component storage, so cloning and no-op
/// transformations are cheap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    path: Arc<[String]>,
    wildcard: bool,
}

impl PathKey {
    pub fn new<I, C>(components: I, wildcard: bool) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        Self {
            path: components.into_iter().map(Into::into).collect(),
            wildcard,
        }
    }

    /// The empty non-wildcard key.
    pub fn empty() -> Self {
        Self {
            path: Arc::from(Vec::new()),
            wildcard: false,
        }
    }

    pub fn components(&self) -> &[String] {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// This key with the given wildcard flag, sharing storage when
    /// nothing changes.
    pub fn with_wildcard(&self, wildcard: bool) -> Self {
        if wildcard == self.wildcard {
            self.clone()
        } else {
            Self {
                path: self.path.clone(),
                wildcard,
            }
        }
    }

    /// This key extended by `suffix`; the result takes `suffix`'s
    /// wildcard flag.
    ///
    /// # Panics
    ///
    /// When `self` is a wildcard key, which has no defined extension.
    pub fn concat(&self, suffix: &PathKey) -> Self {
        assert!(!self.wildcard, "cannot concatenate onto a wildcard key");
        if suffix.is_empty() {
            return self.with_wildcard(suffix.wildcard);
        }
        let mut path = Vec::with_capacity(self.len() + suffix.len());
        path.extend_from_slice(&self.path);
        path.extend_from_slice(&suffix.path);
        Self {
            path: path.into(),
            wildcard: suffix.wildcard,
        }
    }

    /// The non-wildcard key holding the given component range.
    pub fn slice(&self, range: Range<usize>) -> Self {
        if range.start == 0 && range.end == self.len() && !self.wildcard {
            return self.clone();
        }
        Self {
            path: self.path[range].to_vec().into(),
            wildcard: false,
        }
    }

    /// Render with explicit formatting options.
    pub fn to_string_with(&self, format: &KeyFormat<'_>) -> String {
        let mut parts: Vec<String> = self
            .path
            .iter()
            .map(|component| {
                if format.quote {
                    format!("{component:?}")
                } else {
                    component.clone()
                }
            })
            .collect();
        if format.reverse {
            parts.reverse();
        }
        if self.wildcard {
            if let Some(marker) = format.wildcard {
                parts.push(marker.to_owned());
            }
        }

        let mut out = String::from(format.prefix);
        if format.separate_prefix && !parts.is_empty() {
            out.push_str(format.separator);
        }
        out.push_str(&parts.join(format.separator));
        out.push_str(format.suffix);
        out
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with(&KeyFormat::default()))
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PathKey({})",
            self.to_string_with(&KeyFormat {
                quote: true,
                ..KeyFormat::default()
            })
        )
    }
}

/// Formatting options for [`PathKey::to_string_with`].
///
/// The defaults render URI-path style: `/a/b`, with wildcard keys ending
/// in `*`.
#[derive(Debug, Clone)]
pub struct KeyFormat<'a> {
    /// Text before the first component. Default `"/"`.
    pub prefix: &'a str,
    /// Text after the last component. Default `""`.
    pub suffix: &'a str,
    /// Text between components. Default `"/"`.
    pub separator: &'a str,
    /// Whether a separator also follows the prefix when there are
    /// components. Default `false`.
    pub separate_prefix: bool,
    /// Whether components render quoted. Default `false`.
    pub quote: bool,
    /// Whether components render in reverse order (useful for hostname
    /// keys). Default `false`.
    pub reverse: bool,
    /// Marker appended for wildcard keys, or `None` to omit. Default
    /// `Some("*")`.
    pub wildcard: Option<&'a str>,
}

impl Default for KeyFormat<'_> {
    fn default() -> Self {
        Self {
            prefix: "/",
            suffix: "",
            separator: "/",
            separate_prefix: false,
            quote: false,
            reverse: false,
            wildcard: Some("*"),
        }
    }
}
