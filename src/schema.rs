use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, NgramTokenizer, TextAnalyzer};

/// Tokenizer registered for the n-gram fields: overlapping character
/// n-grams of length 1..=3, lowercased. Both `content` and `path_content`
/// use it, so a regex-over-path query can reuse the content pipeline.
pub const NGRAM_TOKENIZER: &str = "ngram1_3";

pub const MIN_GRAM: usize = 1;
pub const MAX_GRAM: usize = 3;

/// Tag value marking a root marker document.
pub const INDEXED_PATH_TAG: &str = "indexed_path";

/// Fields every document carries. `path` is the unique key.
pub const REQUIRED_FIELDS: &[&str] = &[
    "path",
    "path_content",
    "content",
    "tag",
    "create_time",
    "modified_time",
];

#[derive(Clone)]
pub struct DocFields {
    schema: Schema,

    // Canonical absolute path of the indexed file; raw term, unique key.
    pub path: Field,
    // The path again, analyzed with the content n-gram pipeline.
    pub path_content: Field,
    pub content: Field,

    // Keyword tag; `indexed_path` marks a root marker document.
    pub tag: Field,

    // Unix seconds, captured at index time.
    pub create_time: Field,
    pub modified_time: Field,
}

impl DocFields {
    pub fn new() -> Self {
        let mut builder = Schema::builder();

        let ngram = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(NGRAM_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );

        let path = builder.add_text_field("path", STRING | STORED);
        let path_content = builder.add_text_field("path_content", ngram.clone());
        let content = builder.add_text_field("content", ngram);
        let tag = builder.add_text_field("tag", STRING | STORED);
        let create_time = builder.add_u64_field("create_time", STORED);
        let modified_time = builder.add_u64_field("modified_time", STORED);

        Self {
            path,
            path_content,
            content,
            tag,
            create_time,
            modified_time,
            schema: builder.build(),
        }
    }

    pub fn schema(&self) -> Schema {
        self.schema.clone()
    }
}

impl Default for DocFields {
    fn default() -> Self {
        Self::new()
    }
}

/// The analyzer backing [`NGRAM_TOKENIZER`]. Registered on every opened
/// index; an index created by an older build without it cannot be queried.
pub fn ngram_analyzer() -> TextAnalyzer {
    TextAnalyzer::from(NgramTokenizer::new(MIN_GRAM, MAX_GRAM, false)).filter(LowerCaser)
}
