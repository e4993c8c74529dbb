//! Deterministic rule matcher.
//!
//! Catches the mechanical errors a model should not be paid for: a fixed
//! dictionary of commonly confused words, half-width punctuation inside
//! Chinese text, doubled punctuation, and stray spaces between Han
//! characters.

use super::{CandidateProducer, Candidates, ProduceRequest};
use crate::error::{PipelineError, Result};
use crate::text::byte_to_utf16;
use crate::types::{meta_keys, ErrorItem, ErrorType};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;

/// Common confusions: wrong form, correct form.
const CONFUSIONS: &[(&str, &str)] = &[
    ("高行", "高兴"),
    ("以经", "已经"),
    ("再接再励", "再接再厉"),
    ("在次", "再次"),
    ("即然", "既然"),
    ("按装", "安装"),
    ("迫不急待", "迫不及待"),
    ("震憾", "震撼"),
    ("一股作气", "一鼓作气"),
    ("默守成规", "墨守成规"),
    ("谈笑风声", "谈笑风生"),
    ("甘败下风", "甘拜下风"),
    ("走头无路", "走投无路"),
    ("川流不习", "川流不息"),
    ("变本加利", "变本加厉"),
    ("针贬", "针砭"),
    ("幅射", "辐射"),
    ("渡假", "度假"),
    ("份内", "分内"),
];

const CONFUSION_CONFIDENCE: f64 = 0.95;
const PUNCT_CONFIDENCE: f64 = 0.9;

/// Whether `c` is a CJK ideograph.
pub fn is_han(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xF900..=0xFAFF
        | 0x20000..=0x2A6DF
        | 0x2A700..=0x2EBEF
        | 0x30000..=0x3134F)
}

fn full_width(c: char) -> Option<char> {
    Some(match c {
        ',' => '，',
        ';' => '；',
        ':' => '：',
        '?' => '？',
        '!' => '！',
        _ => return None,
    })
}

/// Regex-driven [`CandidateProducer`]. Never touches the network.
#[derive(Debug, Clone)]
pub struct RuleProducer {
    confusion: Regex,
    corrections: HashMap<&'static str, &'static str>,
    half_width: Regex,
    repeated: Regex,
    spaces: Regex,
}

impl RuleProducer {
    pub fn new() -> Result<Self> {
        let corrections: HashMap<_, _> = CONFUSIONS
            .iter()
            .filter(|(wrong, right)| wrong != right)
            .copied()
            .collect();
        // longest alternatives first so a phrase beats its prefix
        let mut keys: Vec<&str> = corrections.keys().copied().collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let pattern = keys
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");

        let compile = |p: &str| {
            Regex::new(p).map_err(|e| PipelineError::InvalidConfig(format!("rule pattern: {e}")))
        };
        Ok(Self {
            confusion: compile(&pattern)?,
            corrections,
            half_width: compile(r"[,;:?!]")?,
            repeated: compile(r"[，。；：、]{2,}")?,
            spaces: compile(r"[ \t\u{3000}]+")?,
        })
    }

    /// Run every rule over `text`. Items come out in rule order, not span order.
    pub fn scan(&self, text: &str) -> Vec<ErrorItem> {
        let mut items = Vec::new();
        let span = |m: &regex::Match<'_>| (byte_to_utf16(text, m.start()), byte_to_utf16(text, m.end()));
        let between_han = |m: &regex::Match<'_>| {
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            before.is_some_and(is_han) && after.is_some_and(is_han)
        };

        for m in self.confusion.find_iter(text) {
            let Some(right) = self.corrections.get(m.as_str()) else {
                continue;
            };
            let (start, end) = span(&m);
            items.push(
                rule_item(start, end, m.as_str(), right, ErrorType::Spelling, "confusion", CONFUSION_CONFIDENCE)
                    .with_explanation(format!("“{}”应为“{}”", m.as_str(), right)),
            );
        }

        for m in self.half_width.find_iter(text) {
            if !between_han(&m) {
                continue;
            }
            let Some(fixed) = m.as_str().chars().next().and_then(full_width) else {
                continue;
            };
            let (start, end) = span(&m);
            items.push(
                rule_item(start, end, m.as_str(), &fixed.to_string(), ErrorType::Punctuation, "half-width-punct", PUNCT_CONFIDENCE)
                    .with_explanation("中文语境应使用全角标点"),
            );
        }

        for m in self.repeated.find_iter(text) {
            let Some(first) = m.as_str().chars().next() else {
                continue;
            };
            let (start, end) = span(&m);
            items.push(
                rule_item(start, end, m.as_str(), &first.to_string(), ErrorType::Punctuation, "repeated-punct", PUNCT_CONFIDENCE)
                    .with_explanation("标点重复"),
            );
        }

        for m in self.spaces.find_iter(text) {
            if !between_han(&m) {
                continue;
            }
            let (start, end) = span(&m);
            items.push(
                rule_item(start, end, m.as_str(), "", ErrorType::Fluency, "han-space", PUNCT_CONFIDENCE)
                    .with_explanation("汉字之间多余空格"),
            );
        }

        items
    }
}

fn rule_item(
    start: usize,
    end: usize,
    text: &str,
    suggestion: &str,
    error_type: ErrorType,
    rule_id: &str,
    confidence: f64,
) -> ErrorItem {
    ErrorItem::new(start, end, text, suggestion, error_type)
        .with_confidence(confidence)
        .with_meta(meta_keys::SOURCE, "rule")
        .with_meta(meta_keys::RULE_ID, rule_id)
        .with_meta(meta_keys::EXACT_LOCATION, true)
}

#[async_trait]
impl CandidateProducer for RuleProducer {
    fn source(&self) -> &'static str {
        "rule"
    }

    async fn produce(&self, text: &str, request: &ProduceRequest) -> Result<Candidates> {
        request.cancel.check()?;
        Ok(Candidates::new(self.scan(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelReason, CancelSignal};
    use crate::text::Utf16Text;

    fn scan(text: &str) -> Vec<ErrorItem> {
        RuleProducer::new().unwrap().scan(text)
    }

    #[test]
    fn test_confusion_dictionary() {
        let items = scan("我今天很高行。");
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!((item.start, item.end), (4, 6));
        assert_eq!(item.suggestion, "高兴");
        assert_eq!(item.error_type, ErrorType::Spelling);
        assert_eq!(item.metadata[meta_keys::RULE_ID], "confusion");
        assert_eq!(item.confidence(), Some(CONFUSION_CONFIDENCE));
    }

    #[test]
    fn test_half_width_punctuation_only_between_han() {
        let items = scan("你好,世界!Hello, world");
        assert_eq!(items.len(), 1, "{items:?}");
        assert_eq!(items[0].text, ",");
        assert_eq!(items[0].suggestion, "，");
        assert_eq!(items[0].start, 2);
    }

    #[test]
    fn test_repeated_punctuation() {
        let items = scan("好的。。我们走，，");
        let texts: Vec<_> = items.iter().map(|i| (i.text.as_str(), i.suggestion.as_str())).collect();
        assert_eq!(texts, vec![("。。", "。"), ("，，", "，")]);
    }

    #[test]
    fn test_space_between_han() {
        let items = scan("我们 去公园， Rust 很好");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].error_type, ErrorType::Fluency);
        assert_eq!(items[0].suggestion, "");
        assert_eq!((items[0].start, items[0].end), (2, 3));
    }

    #[test]
    fn test_spans_are_utf16_and_slice_exactly() {
        let text = "𠮷野家以经开门,欢迎光临";
        let t = Utf16Text::new(text);
        let items = scan(text);
        assert_eq!(items.len(), 2);
        for item in &items {
            assert!(t.slice_matches(item.start, item.end, &item.text), "{item:?}");
        }
        assert_eq!(items[0].start, 4);
    }

    #[tokio::test]
    async fn test_produce_respects_cancel() {
        let producer = RuleProducer::new().unwrap();
        let cancel = CancelSignal::new();
        let ok = producer
            .produce("以经", &ProduceRequest::new("", cancel.clone()))
            .await
            .unwrap();
        assert_eq!(ok.items.len(), 1);

        cancel.cancel(CancelReason::Aborted);
        let err = producer
            .produce("以经", &ProduceRequest::new("", cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
