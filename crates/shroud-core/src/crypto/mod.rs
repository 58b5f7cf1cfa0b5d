pub mod stream_cipher;
