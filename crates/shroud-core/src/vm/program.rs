//! The sealed artifact handed from the builder to the interpreter.

use std::fmt;
use std::sync::Arc;

use crate::crypto::stream_cipher::{self, CipherKey, StreamReader};
use crate::vm::opcode::OpcodeTable;

/// Encrypted bytecode plus everything needed to run it.
#[derive(Clone)]
pub struct SealedProgram {
    bytes: Vec<u8>,
    key: CipherKey,
    table: Arc<OpcodeTable>,
    code_len: usize,
}

impl SealedProgram {
    /// Assemble a program from already encrypted bytes.
    pub fn from_parts(bytes: Vec<u8>, key: CipherKey, table: Arc<OpcodeTable>, code_len: usize) -> Self {
        let code_len = code_len.min(bytes.len());
        SealedProgram { bytes, key, table, code_len }
    }

    /// Ciphertext, padding included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Length of the executable prefix.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    pub fn table(&self) -> &Arc<OpcodeTable> {
        &self.table
    }

    /// Sequential decrypting view over the ciphertext.
    pub fn reader(&self) -> StreamReader<'_> {
        StreamReader::new(&self.bytes, self.key)
    }

    /// Whole plaintext. Diagnostics only; the interpreter never calls this.
    pub fn decrypt_all(&self) -> Vec<u8> {
        stream_cipher::decrypt(&self.bytes, &self.key)
    }
}

impl fmt::Debug for SealedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedProgram")
            .field("len", &self.bytes.len())
            .field("code_len", &self.code_len)
            .finish_non_exhaustive()
    }
}
