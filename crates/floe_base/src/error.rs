//! Canonical error codes surfaced by the HTTP error envelope.
//!
//! The set is closed: clients branch on these strings, so new failure modes
//! must be mapped onto an existing code or added here deliberately.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequestBody,
    InvalidCreateUploadRequest,
    InvalidFileSize,
    FileTooLarge,
    InvalidFilename,
    InvalidContentType,
    InvalidChunkSize,
    InvalidTotalChunks,
    TooManyChunks,
    UploadCapacityReached,
    InvalidUploadId,
    UploadNotFound,
    UploadAlreadyCompleted,
    UploadIncomplete,
    UploadFinalizationInProgress,
    InvalidChunk,
    ChunkStreamError,
    ChunkUploadFailed,
    ChunkInProgress,
    SessionCreateFailed,
    UploadFailed,
    InvalidEpochs,
    RateLimited,
    InternalError,
    FileNotFound,
    SuiUnavailable,
    InvalidFileMetadata,
    InvalidRange,
    WalrusRangeUnsupported,
    WalrusReadFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequestBody => "INVALID_REQUEST_BODY",
            Self::InvalidCreateUploadRequest => "INVALID_CREATE_UPLOAD_REQUEST",
            Self::InvalidFileSize => "INVALID_FILE_SIZE",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::InvalidFilename => "INVALID_FILENAME",
            Self::InvalidContentType => "INVALID_CONTENT_TYPE",
            Self::InvalidChunkSize => "INVALID_CHUNK_SIZE",
            Self::InvalidTotalChunks => "INVALID_TOTAL_CHUNKS",
            Self::TooManyChunks => "TOO_MANY_CHUNKS",
            Self::UploadCapacityReached => "UPLOAD_CAPACITY_REACHED",
            Self::InvalidUploadId => "INVALID_UPLOAD_ID",
            Self::UploadNotFound => "UPLOAD_NOT_FOUND",
            Self::UploadAlreadyCompleted => "UPLOAD_ALREADY_COMPLETED",
            Self::UploadIncomplete => "UPLOAD_INCOMPLETE",
            Self::UploadFinalizationInProgress => "UPLOAD_FINALIZATION_IN_PROGRESS",
            Self::InvalidChunk => "INVALID_CHUNK",
            Self::ChunkStreamError => "CHUNK_STREAM_ERROR",
            Self::ChunkUploadFailed => "CHUNK_UPLOAD_FAILED",
            Self::ChunkInProgress => "CHUNK_IN_PROGRESS",
            Self::SessionCreateFailed => "SESSION_CREATE_FAILED",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::InvalidEpochs => "INVALID_EPOCHS",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::SuiUnavailable => "SUI_UNAVAILABLE",
            Self::InvalidFileMetadata => "INVALID_FILE_METADATA",
            Self::InvalidRange => "INVALID_RANGE",
            Self::WalrusRangeUnsupported => "WALRUS_RANGE_UNSUPPORTED",
            Self::WalrusReadFailed => "WALRUS_READ_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::UploadFinalizationInProgress).unwrap();
        assert_eq!(json, "\"UPLOAD_FINALIZATION_IN_PROGRESS\"");
        assert_eq!(ErrorCode::WalrusReadFailed.as_str(), "WALRUS_READ_FAILED");
    }
}
