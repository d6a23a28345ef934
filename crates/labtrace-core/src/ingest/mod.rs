mod dates;
mod extractor;
mod layout;
mod ocr;
mod pipeline;
mod preprocessor;
mod reader;
mod vocabulary;

pub use dates::detect_document_date;
pub use extractor::{BiomarkerExtractor, ExtractionOutput, UNITS};
pub use ocr::{OcrEngine, OcrError, OcrOutput, OcrResult, TesseractOcr};
pub use pipeline::{
    IngestError, IngestResult, Stage, SubmittedUpload, UploadOrchestrator, UploadRequest,
    ValidationError,
};
pub use preprocessor::{
    ConfidenceScore, PreprocessConfig, PreprocessedText, Preprocessor, ProcessingMetadata,
    ProcessingStep, QualityMetrics,
};
pub use reader::{
    DocumentFormat, DocxReader, FormatExtractionError, FormatReader, ImageReader, OcrInfo,
    PdfReader, PlainTextReader, RawExtraction, ReadResult, ReaderError, ReaderRegistry,
    DOCX_MIME, IMAGE_MIMES, PAGE_BREAK, PDF_MIME, PLAIN_TEXT_MIME,
};
pub use vocabulary::{NameMatch, Vocabulary, VocabularyEntry};
