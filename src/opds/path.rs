//! Acquisition path resolution.
//!
//! A feed entry advertises zero or more acquisition links, each possibly
//! nesting indirection steps. Path resolution flattens those links into
//! ordered [`AcquisitionPath`]s; the borrow pipeline consumes the first
//! path whose final element is a format the client can store.

use url::Url;

use super::{AcquisitionLink, ContentKind, FeedEntry, IndirectAcquisition};

/// One hop of an acquisition path: the content type expected at this hop
/// and the target URI, when the hop carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionPathElement {
    /// The content type expected from this hop.
    pub content_type: ContentKind,
    /// The URI to fetch for this hop. Indirect hops have no URI of their
    /// own; the previous hop's response supplies the next location.
    pub target: Option<Url>,
}

impl AcquisitionPathElement {
    /// Creates a path element.
    #[must_use]
    pub fn new(content_type: ContentKind, target: Option<Url>) -> Self {
        Self {
            content_type,
            target,
        }
    }
}

/// An ordered, non-empty sequence of acquisition hops ending in a usable
/// format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionPath {
    elements: Vec<AcquisitionPathElement>,
}

impl AcquisitionPath {
    /// Creates a path from its elements.
    ///
    /// # Panics
    ///
    /// Panics if `elements` is empty; an empty path is a programming
    /// error.
    #[must_use]
    pub fn new(elements: Vec<AcquisitionPathElement>) -> Self {
        assert!(!elements.is_empty(), "acquisition path must be non-empty");
        Self { elements }
    }

    /// The elements in order.
    #[must_use]
    pub fn elements(&self) -> &[AcquisitionPathElement] {
        &self.elements
    }

    /// The final element: the usable format the path produces.
    #[must_use]
    pub fn final_element(&self) -> &AcquisitionPathElement {
        match self.elements.last() {
            Some(element) => element,
            None => unreachable!("acquisition path is non-empty"),
        }
    }
}

fn flatten_indirect(
    head: Vec<AcquisitionPathElement>,
    indirect: &[IndirectAcquisition],
    out: &mut Vec<AcquisitionPath>,
) {
    if indirect.is_empty() {
        out.push(AcquisitionPath::new(head));
        return;
    }
    for step in indirect {
        let mut chain = head.clone();
        chain.push(AcquisitionPathElement::new(step.content_type.clone(), None));
        flatten_indirect(chain, &step.indirect, out);
    }
}

fn paths_of_link(link: &AcquisitionLink) -> Vec<AcquisitionPath> {
    let head = vec![AcquisitionPathElement::new(
        link.content_type.clone(),
        link.target.clone(),
    )];
    let mut out = Vec::new();
    flatten_indirect(head, &link.indirect, &mut out);
    out
}

/// Resolves the ordered acquisition paths of a feed entry, restricted to
/// paths whose final element is one of `supported_formats`.
///
/// Paths appear in catalog order: link order first, indirection order
/// within a link second. An entry may yield no paths at all, in which
/// case the acquisition is unsupported.
#[must_use]
pub fn acquisition_paths(
    entry: &FeedEntry,
    supported_formats: &[ContentKind],
) -> Vec<AcquisitionPath> {
    entry
        .acquisitions
        .iter()
        .flat_map(paths_of_link)
        .filter(|path| {
            supported_formats
                .iter()
                .any(|kind| path.final_element().content_type.is_compatible_with(kind))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::opds::Availability;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(acquisitions: Vec<AcquisitionLink>) -> FeedEntry {
        FeedEntry {
            id: "urn:uuid:test".to_string(),
            title: "Test".to_string(),
            availability: Availability::Loaned,
            acquisitions,
            cover: None,
            thumbnail: None,
        }
    }

    #[test]
    fn test_direct_link_yields_single_element_path() {
        let e = entry(vec![AcquisitionLink {
            content_type: ContentKind::epub(),
            target: Some(url("https://example.com/book.epub")),
            indirect: vec![],
        }]);

        let paths = acquisition_paths(&e, &[ContentKind::epub()]);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].elements().len(), 1);
        assert_eq!(paths[0].final_element().content_type, ContentKind::epub());
        assert!(paths[0].elements()[0].target.is_some());
    }

    #[test]
    fn test_indirect_link_yields_chained_path() {
        let e = entry(vec![AcquisitionLink {
            content_type: ContentKind::new("application/atom+xml"),
            target: Some(url("https://example.com/borrow")),
            indirect: vec![IndirectAcquisition {
                content_type: ContentKind::pdf(),
                indirect: vec![],
            }],
        }]);

        let paths = acquisition_paths(&e, &[ContentKind::pdf()]);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].elements().len(), 2);
        assert!(paths[0].elements()[1].target.is_none());
        assert_eq!(paths[0].final_element().content_type, ContentKind::pdf());
    }

    #[test]
    fn test_unsupported_final_format_is_filtered() {
        let e = entry(vec![AcquisitionLink {
            content_type: ContentKind::new("application/x-mobipocket-ebook"),
            target: Some(url("https://example.com/book.mobi")),
            indirect: vec![],
        }]);

        let paths = acquisition_paths(&e, &[ContentKind::epub(), ContentKind::pdf()]);
        assert!(paths.is_empty());
    }

    #[test]
    fn test_paths_preserve_catalog_order() {
        let e = entry(vec![
            AcquisitionLink {
                content_type: ContentKind::pdf(),
                target: Some(url("https://example.com/book.pdf")),
                indirect: vec![],
            },
            AcquisitionLink {
                content_type: ContentKind::epub(),
                target: Some(url("https://example.com/book.epub")),
                indirect: vec![],
            },
        ]);

        let paths = acquisition_paths(&e, &[ContentKind::epub(), ContentKind::pdf()]);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].final_element().content_type, ContentKind::pdf());
        assert_eq!(paths[1].final_element().content_type, ContentKind::epub());
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn test_empty_path_panics() {
        let _ = AcquisitionPath::new(vec![]);
    }
}
