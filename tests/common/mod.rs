//! A scripted server peer for driving a client session over an in-memory pipe

#![allow(dead_code)]

use secure_file_upload::checksum::StreamingChecksum;
use secure_file_upload::keys::{encrypt_for, SessionKey};
use secure_file_upload::protocol::{
    ChecksumStatusPayload, FileUploaded, KeyExchangePayload, MessageFramer, RegisterPayload,
    Request, RequestCode, ResponseCode, UploadFilePayload, UserId, WireFormat,
};
use secure_file_upload::transfer::CbcStreamDecryptor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const PIPE_CAPACITY: usize = 64 * 1024;

/// What the peer saw during one upload
#[derive(Debug)]
pub struct ReceivedUpload {
    pub request: Request<UploadFilePayload>,
    pub plaintext: Vec<u8>,
    pub checksum: u32,
}

pub struct ScriptedServer {
    pub stream: DuplexStream,
}

impl ScriptedServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }

    pub async fn expect_register(&mut self, user_id: UserId) -> Request<RegisterPayload> {
        let request: Request<RegisterPayload> =
            MessageFramer::receive_fixed(&mut self.stream).await.unwrap();
        assert_eq!(request.header.request_code().unwrap(), RequestCode::Register);
        MessageFramer::send_response(&mut self.stream, ResponseCode::RegisterSuccess, &user_id)
            .await
            .unwrap();
        request
    }

    pub async fn receive_key_exchange(&mut self) -> Request<KeyExchangePayload> {
        let request: Request<KeyExchangePayload> =
            MessageFramer::receive_fixed(&mut self.stream).await.unwrap();
        assert_eq!(request.header.request_code().unwrap(), RequestCode::KeyExchange);
        request
    }

    /// Answer a key exchange with a fresh wrapped session key
    pub async fn expect_key_exchange(&mut self) -> SessionKey {
        let request = self.receive_key_exchange().await;
        let session_key = SessionKey::generate();
        let wrapped = encrypt_for(&request.payload.public_key, session_key.as_bytes()).unwrap();

        let mut payload = request.header.user_id.to_vec();
        payload.extend_from_slice(&wrapped);
        self.send(ResponseCode::ExchangeAes, &payload).await;
        session_key
    }

    /// Receive one upload, decrypt it and reply with `reported` or the real CRC
    pub async fn expect_upload(
        &mut self,
        session_key: &SessionKey,
        reported: Option<u32>,
    ) -> ReceivedUpload {
        let request: Request<UploadFilePayload> =
            MessageFramer::receive_fixed(&mut self.stream).await.unwrap();
        assert_eq!(request.header.request_code().unwrap(), RequestCode::UploadFile);

        let ciphertext = MessageFramer::receive_variable(
            &mut self.stream,
            request.payload.content_size as usize,
        )
        .await
        .unwrap();

        let mut decryptor = CbcStreamDecryptor::new(session_key);
        let mut plaintext = Vec::new();
        decryptor.update(&ciphertext, &mut plaintext);
        decryptor.finalize(&mut plaintext).unwrap();

        let mut checksum = StreamingChecksum::new();
        checksum.update(&plaintext);
        let checksum = checksum.finalize();

        let reply = FileUploaded {
            client_id: request.payload.client_id,
            content_size: request.payload.content_size,
            file_name: request.payload.file_name.clone(),
            checksum: reported.unwrap_or(checksum),
        };
        self.send(ResponseCode::FileUploaded, &reply.to_bytes()).await;

        ReceivedUpload {
            request,
            plaintext,
            checksum,
        }
    }

    pub async fn receive_status(&mut self) -> (RequestCode, Request<ChecksumStatusPayload>) {
        let request: Request<ChecksumStatusPayload> =
            MessageFramer::receive_fixed(&mut self.stream).await.unwrap();
        let code = request.header.request_code().unwrap();
        (code, request)
    }

    /// Receive a checksum status report and acknowledge it
    pub async fn expect_status(&mut self) -> (RequestCode, Request<ChecksumStatusPayload>) {
        let (code, request) = self.receive_status().await;
        self.send(ResponseCode::MessageOk, &request.header.user_id).await;
        (code, request)
    }

    pub async fn send(&mut self, code: ResponseCode, payload: &[u8]) {
        MessageFramer::send_response(&mut self.stream, code, payload)
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Everything the client wrote before closing its end
    pub async fn read_remaining(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).await.unwrap();
        rest
    }
}
