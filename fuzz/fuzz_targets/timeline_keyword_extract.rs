#![no_main]

use libfuzzer_sys::fuzz_target;
use riina_misskey::TimelineNote;
use riina_runtime::{KeywordExtractor, NgWordFilter};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let notes: Vec<TimelineNote> = raw
        .split('\n')
        .enumerate()
        .map(|(index, line)| TimelineNote {
            id: format!("n{index}"),
            author_id: "fuzz".to_string(),
            text: Some(line.to_string()),
        })
        .collect();
    let ng_words = NgWordFilter::new(&["ng".to_string()]);
    let Ok(extractor) = KeywordExtractor::new(2) else {
        return;
    };
    let keywords = extractor.extract(&notes, &ng_words);
    for keyword in &keywords {
        assert!(keyword.chars().count() >= 2);
    }
    let mut unique = keywords.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), keywords.len());
});
