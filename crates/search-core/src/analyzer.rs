use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer, Token,
    TokenStream,
};

/// Term analyzer shared by sparse indexing and sparse querying.
#[derive(Clone)]
pub struct Analyzer {
    inner: TextAnalyzer,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::english()
    }
}

impl Analyzer {
    /// Splits on non-alphanumerics, drops tokens over 40 bytes, lowercases and
    /// applies the English Snowball stemmer.
    pub fn english() -> Self {
        let inner = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .filter(Stemmer::new(Language::English))
            .build();
        Self { inner }
    }

    pub fn terms(&self, text: &str) -> Vec<String> {
        let mut analyzer = self.inner.clone();
        let mut stream = analyzer.token_stream(text);
        let mut out = Vec::new();
        stream.process(&mut |token: &Token| out.push(token.text.clone()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::Analyzer;

    #[test]
    fn stems_and_lowercases() {
        let analyzer = Analyzer::english();
        assert_eq!(analyzer.terms("Wandb LOGS images"), vec!["wandb", "log", "imag"]);
        assert_eq!(analyzer.terms("log image"), vec!["log", "imag"]);
    }

    #[test]
    fn punctuation_only_yields_no_terms() {
        assert!(Analyzer::english().terms("?! ...").is_empty());
    }
}
