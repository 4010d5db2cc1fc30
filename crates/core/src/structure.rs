use crate::error::StructureError;
use crate::llm::{extract_json_payload, parse_model_json, CompletionModel, CompletionRequest};
use crate::models::PaperStructure;
use tracing::{debug, info};

const STRUCTURE_SYSTEM_PROMPT: &str = r#"You analyse academic papers and return their structure as one JSON object inside a ```json fenced block.

Return exactly these keys:
{
  "document_title": "title of the paper",
  "authors": [{"name": "...", "affiliations": ["..."], "email": "..."}],
  "sections": [{"section_name": "Introduction", "section_number": "1", "start_page": 1, "confidence": "high|medium|low", "content": "full section text"}]
}

Only extract major sections: Abstract, Introduction, Methodology, Results, Conclusion, Related Work, and Motivation or Findings when they stand alone. Merge subsections (3.1, 3.2, ...) into their parent. Skip references, acknowledgments and appendices. Use "NAN" for a missing section number. Pages are marked {PAGE N} in the text. Escape quotes inside strings and keep every string on one line."#;

pub struct StructureExtractor<M> {
    model: M,
}

impl<M: CompletionModel> StructureExtractor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// Classifies the whole normalized document in a single model call.
    pub async fn extract(&self, normalized_text: &str) -> Result<PaperStructure, StructureError> {
        let request = CompletionRequest::new(STRUCTURE_SYSTEM_PROMPT, normalized_text);
        let response = self.model.complete(&request).await?;
        let structure = parse_structure(&response)?;

        info!(
            title = %structure.document_title,
            authors = structure.authors.len(),
            sections = structure.sections.len(),
            "extracted document structure"
        );
        Ok(structure)
    }
}

/// Parses a structure reply, dropping authors and sections with no name.
pub fn parse_structure(response: &str) -> Result<PaperStructure, StructureError> {
    let payload = extract_json_payload(response).ok_or(StructureError::NoJson)?;
    let mut structure: PaperStructure = parse_model_json(payload)?;

    structure.document_title = structure.document_title.trim().to_string();

    let authors_before = structure.authors.len();
    structure.authors.retain(|author| !author.name.trim().is_empty());
    let sections_before = structure.sections.len();
    structure
        .sections
        .retain(|section| !section.section_name.trim().is_empty());

    let dropped_authors = authors_before - structure.authors.len();
    let dropped_sections = sections_before - structure.sections.len();
    if dropped_authors > 0 || dropped_sections > 0 {
        debug!(dropped_authors, dropped_sections, "dropped unnamed structure records");
    }

    Ok(structure)
}
