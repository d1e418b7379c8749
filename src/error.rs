use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GwasError {
    #[error("invalid site key: {0}")]
    InvalidSiteKey(String),

    #[error("invalid composite key: {0}")]
    InvalidCompositeKey(String),

    #[error("invalid study-snp key: {0}")]
    InvalidStudySnpKey(String),

    #[error("invalid reference genome: {0}")]
    InvalidRefGenome(String),

    #[error("invalid super population: {0}")]
    InvalidSuperPopulation(String),

    #[error("invalid value type: {0}")]
    InvalidValueKind(String),

    #[error("invalid MAF cohort: {0}")]
    InvalidCohort(String),

    #[error("invalid study type: {0}")]
    InvalidStudyType(String),

    #[error("none of the requested ethnicities are available; choose from: {available}")]
    InvalidEthnicities { available: String },

    #[error("no studies match the requested filters")]
    NoMatchingStudies,

    #[error("GWAS file is missing required columns: {0}")]
    MissingColumns(String),

    #[error("GWAS file row {line} is invalid: {message}")]
    InvalidRow { line: usize, message: String },

    #[error(
        "duplicate association for {site} (trait {trait_name}, study {study_id}, key {composite})"
    )]
    DuplicateAssociation {
        site: String,
        trait_name: String,
        study_id: String,
        composite: String,
    },

    #[error("unsupported input format: {0}")]
    InputFormat(String),

    #[error("PRS server request failed: {0}")]
    BackendHttp(String),

    #[error("PRS server returned status {status}: {message}")]
    BackendStatus { status: u16, message: String },

    #[error("PRS server timed out: {0}")]
    ServerTimeout(String),

    #[error("variant annotation request failed: {0}")]
    AnnotationHttp(String),

    #[error("failed to parse JSON: {0}")]
    Json(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
