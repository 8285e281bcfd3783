use log::debug;
use regex::Regex;

use crate::error::SlicerError;

/// One delimiter-matched span of raw text representing a single item
/// occurrence in the stream, paired with its zero-based sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFragment {
    /// Position of this fragment in the overall stream, starting at 0.
    pub index: usize,
    /// The matched text span, exactly as it appeared in the stream.
    pub text: String,
}

/// Incremental stream slicer.
///
/// The extractor is fed arbitrary-sized text chunks and yields every
/// complete fragment matching the delimiter pattern as soon as it becomes
/// matchable. Unmatched data is retained and concatenated with future
/// input, so a fragment split across several `feed` calls is still matched
/// correctly. Consumed data is discarded, so memory held is bounded by the
/// distance between the start of unconsumed data and the next match, not
/// by total stream length.
///
/// A pattern that never matches causes unbounded buffer growth; this is an
/// accepted limitation and is not capped.
///
/// # Examples
///
/// ```
/// use xml_slicer::core::extractor::FragmentExtractor;
///
/// let mut extractor = FragmentExtractor::new(r"<Item(.|\n|\r)*?</Item>").unwrap();
///
/// // The fragment is split across two chunks.
/// let first = extractor.feed("<feed><Item>A").unwrap();
/// assert!(first.is_empty());
///
/// let second = extractor.feed("</Item>trailing").unwrap();
/// assert_eq!(second.len(), 1);
/// assert_eq!(second[0].text, "<Item>A</Item>");
/// assert_eq!(second[0].index, 0);
///
/// assert!(extractor.finish().unwrap().is_empty());
/// assert_eq!(extractor.residual(), "trailing");
/// ```
pub struct FragmentExtractor {
    pattern: Regex,
    buffer: String,
    index: usize,
}

impl FragmentExtractor {
    /// Compiles the delimiter pattern.
    ///
    /// A pattern that can match an empty span is rejected here: an empty
    /// match makes no forward progress and would loop forever during
    /// extraction.
    pub fn new(pattern: &str) -> Result<Self, SlicerError> {
        let pattern =
            Regex::new(pattern).map_err(|e| SlicerError::InvalidPattern(e.to_string()))?;

        if pattern.find("").is_some() {
            return Err(SlicerError::EmptyMatchPattern);
        }

        Ok(Self {
            pattern,
            buffer: String::new(),
            index: 0,
        })
    }

    /// Appends `chunk` to the accumulation buffer and drains every complete
    /// fragment out of it.
    ///
    /// The pattern is applied to the current buffer from position 0; each
    /// match is emitted and the buffer truncated past the match end before
    /// the next attempt. The unmatched remainder is retained for the next
    /// call.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<ItemFragment>, SlicerError> {
        self.buffer.push_str(chunk);
        self.extract()
    }

    /// Runs one final extraction pass over the retained buffer at
    /// end-of-stream.
    pub fn finish(&mut self) -> Result<Vec<ItemFragment>, SlicerError> {
        self.extract()
    }

    /// The unconsumed buffer suffix: everything received so far that lies
    /// after the end of the last matched fragment.
    pub fn residual(&self) -> &str {
        &self.buffer
    }

    /// Sequence index that will be assigned to the next emitted fragment.
    pub fn sequence(&self) -> usize {
        self.index
    }

    fn extract(&mut self) -> Result<Vec<ItemFragment>, SlicerError> {
        let mut fragments = Vec::new();

        loop {
            let (start, end, text) = match self.pattern.find(&self.buffer) {
                Some(found) => (found.start(), found.end(), found.as_str().to_owned()),
                None => break,
            };

            // The construction-time check rejects most empty-matching
            // patterns, but boundary assertions can still produce an empty
            // span at runtime. Forward progress is required.
            if start == end {
                return Err(SlicerError::EmptyMatch(start));
            }

            debug!("fragment {} matched, {} bytes", self.index, text.len());

            fragments.push(ItemFragment {
                index: self.index,
                text,
            });
            self.index += 1;
            self.buffer.drain(..end);
        }

        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FragmentExtractor {
        FragmentExtractor::new(r"<Item(.|\n|\r)*?</Item>").unwrap()
    }

    #[test]
    fn test_fragment_split_across_feeds() {
        let mut one_shot = extractor();
        let whole = one_shot.feed("<Item>AB</Item>").unwrap();

        let mut split = extractor();
        assert!(split.feed("<Item>AB").unwrap().is_empty());
        let joined = split.feed("</Item>").unwrap();

        assert_eq!(whole, joined);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].text, "<Item>AB</Item>");
    }

    #[test]
    fn test_emission_is_independent_of_chunk_boundaries() {
        let input = "<x><Item a=\"1\">one</Item>garbage<Item a=\"2\">two</Item><Item";

        let mut reference = extractor();
        let mut expected = reference.feed(input).unwrap();
        expected.extend(reference.finish().unwrap());

        for chunk_size in [1, 2, 3, 5, 7, 11, 64] {
            let mut chunked = extractor();
            let mut emitted = Vec::new();
            let mut rest = input;
            while !rest.is_empty() {
                let cut = chunk_size.min(rest.len());
                emitted.extend(chunked.feed(&rest[..cut]).unwrap());
                rest = &rest[cut..];
            }
            emitted.extend(chunked.finish().unwrap());

            assert_eq!(emitted, expected, "chunk size {}", chunk_size);
            assert_eq!(chunked.residual(), reference.residual());
        }
    }

    #[test]
    fn test_residual_is_exactly_the_trailing_unmatched_text() {
        let mut extractor = extractor();
        let fragments = extractor
            .feed("<Item>1</Item><Item>2</Item>trailing <Item> without end")
            .unwrap();

        assert_eq!(fragments.len(), 2);
        assert_eq!(extractor.residual(), "trailing <Item> without end");
    }

    #[test]
    fn test_sequence_indices_are_monotonic_across_feeds() {
        let mut extractor = extractor();
        let first = extractor.feed("<Item>1</Item>").unwrap();
        let second = extractor.feed("<Item>2</Item><Item>3</Item>").unwrap();

        assert_eq!(first[0].index, 0);
        assert_eq!(second[0].index, 1);
        assert_eq!(second[1].index, 2);
        assert_eq!(extractor.sequence(), 3);
    }

    #[test]
    fn test_empty_matching_pattern_is_rejected_at_construction() {
        assert!(matches!(
            FragmentExtractor::new(".*"),
            Err(SlicerError::EmptyMatchPattern)
        ));
        assert!(matches!(
            FragmentExtractor::new("(<Item>)?"),
            Err(SlicerError::EmptyMatchPattern)
        ));
    }

    #[test]
    fn test_runtime_empty_match_is_a_configuration_error() {
        // `\b` never matches inside the empty string, so it survives the
        // construction check, but matches an empty span once data arrives.
        let mut extractor = FragmentExtractor::new(r"\b").unwrap();

        let result = extractor.feed("word");
        assert!(matches!(result, Err(SlicerError::EmptyMatch(0))));
        // The buffer is left intact.
        assert_eq!(extractor.residual(), "word");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(matches!(
            FragmentExtractor::new("<Item("),
            Err(SlicerError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_finish_flushes_nothing_new_without_more_data() {
        let mut extractor = extractor();
        extractor.feed("<Item>1</Item>rest").unwrap();
        assert!(extractor.finish().unwrap().is_empty());
        assert_eq!(extractor.residual(), "rest");
    }
}
