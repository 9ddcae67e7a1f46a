use num_bigint::BigUint;
use sha2::Sha512;

use super::setup::{PairSetup, SetupStepResult};
use super::storage::CredentialHalf;
use super::tlv::{TlvDecoder, TlvEncoder, TlvType, errors};
use super::verify::{PairVerify, PairVerifyVariant, VerifyStepResult};
use super::PairingError;
use crate::protocol::crypto::{
    ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519Signature, HkdfSha512, Nonce, X25519KeyPair,
    X25519PublicKey,
};

/// Minimal HAP-flavored SRP-6a server, used only to drive the client
/// through a realistic M2-M4 exchange in tests.
struct MockSrpServer {
    n: BigUint,
    v: BigUint,
    b: BigUint,
    b_pub: BigUint,
    session_key: Vec<u8>,
    m2: Vec<u8>,
}

impl MockSrpServer {
    fn new(username: &[u8], password: &[u8], salt: &[u8]) -> Self {
        use sha2::Digest;

        let n = BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
              8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B\
              302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9\
              A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6\
              49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8\
              FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D\
              670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C\
              180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
              3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D\
              04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D\
              B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226\
              1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
              BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC\
              E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
            16,
        )
        .unwrap();
        let g = BigUint::from(5u32);

        let k = {
            let mut hasher = Sha512::new();
            hasher.update(n.to_bytes_be());
            let g_bytes = g.to_bytes_be();
            let mut g_padded = vec![0u8; 384];
            g_padded[384 - g_bytes.len()..].copy_from_slice(&g_bytes);
            hasher.update(&g_padded);
            BigUint::from_bytes_be(&hasher.finalize())
        };

        let x = {
            let mut inner = Sha512::new();
            inner.update(username);
            inner.update(b":");
            inner.update(password);
            let h_up = inner.finalize();

            let mut outer = Sha512::new();
            outer.update(salt);
            outer.update(h_up);
            BigUint::from_bytes_be(&outer.finalize())
        };

        let v = g.modpow(&x, &n);
        let b = BigUint::from(987_654_321u32);
        let b_pub = ((&k * &v) + g.modpow(&b, &n)) % &n;

        Self {
            n,
            v,
            b,
            b_pub,
            session_key: Vec::new(),
            m2: Vec::new(),
        }
    }

    fn public_key(&self) -> Vec<u8> {
        let mut bytes = self.b_pub.to_bytes_be();
        if bytes.len() < 384 {
            let mut padded = vec![0u8; 384];
            padded[384 - bytes.len()..].copy_from_slice(&bytes);
            bytes = padded;
        }
        bytes
    }

    fn verify_client(&mut self, a_pub_bytes: &[u8], client_m1: &[u8]) -> Vec<u8> {
        use sha2::Digest;

        let a_pub = BigUint::from_bytes_be(a_pub_bytes);

        let u = {
            let mut hasher = Sha512::new();
            let mut a_padded = vec![0u8; 384];
            let a_bytes = a_pub.to_bytes_be();
            a_padded[384 - a_bytes.len()..].copy_from_slice(&a_bytes);
            hasher.update(&a_padded);

            let mut b_padded = vec![0u8; 384];
            let b_bytes = self.b_pub.to_bytes_be();
            b_padded[384 - b_bytes.len()..].copy_from_slice(&b_bytes);
            hasher.update(&b_padded);
            BigUint::from_bytes_be(&hasher.finalize())
        };

        let s_shared = (a_pub * self.v.modpow(&u, &self.n)).modpow(&self.b, &self.n);

        let k_session = {
            let mut hasher = Sha512::new();
            hasher.update(s_shared.to_bytes_be());
            hasher.finalize().to_vec()
        };

        self.session_key = k_session.clone();

        let mut hasher = Sha512::new();
        hasher.update(a_pub.to_bytes_be());
        hasher.update(client_m1);
        hasher.update(&k_session);
        self.m2 = hasher.finalize().to_vec();

        k_session
    }

    fn server_proof(&self) -> &[u8] {
        &self.m2
    }
}

fn sign_m6(session_key: &[u8], device_identifier: &[u8], device_signing: &Ed25519KeyPair) -> Vec<u8> {
    let hkdf_enc = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), session_key);
    let encrypt_key = hkdf_enc.expand_fixed::<32>(b"Pair-Setup-Encrypt-Info").unwrap();

    let hkdf_sign = HkdfSha512::new(Some(b"Pair-Setup-Accessory-Sign-Salt"), session_key);
    let accessory_x = hkdf_sign.expand(b"Pair-Setup-Accessory-Sign-Info", 32).unwrap();

    let mut sign_data = Vec::new();
    sign_data.extend_from_slice(&accessory_x);
    sign_data.extend_from_slice(device_identifier);
    sign_data.extend_from_slice(device_signing.public_key().as_bytes());
    let signature = device_signing.sign(&sign_data);

    let inner_tlv = TlvEncoder::new()
        .add(TlvType::Identifier, device_identifier)
        .add(TlvType::PublicKey, device_signing.public_key().as_bytes())
        .add(TlvType::Signature, &signature.to_bytes())
        .build();

    let cipher = ChaCha20Poly1305Cipher::new(&encrypt_key).unwrap();
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(b"PS-Msg06");
    let nonce = Nonce::from_bytes(&nonce_bytes).unwrap();
    let encrypted = cipher.encrypt(&nonce, &inner_tlv).unwrap();

    TlvEncoder::new()
        .add_sequence(6)
        .add(TlvType::EncryptedData, &encrypted)
        .build()
}

#[test]
fn pair_setup_m1_has_method_before_sequence_on_the_wire() {
    let mut client = PairSetup::new("client-uuid".to_string());
    let m1 = client.start().unwrap();
    assert_eq!(m1, vec![0x00, 0x01, 0x00, 0x06, 0x01, 0x01]);
}

#[test]
fn pair_setup_completes_and_verifies_the_device_signature() {
    let mut client = PairSetup::new("client-uuid".to_string());
    let pin = "1234";
    client.set_pin(pin);

    let _m1 = client.start().unwrap();

    let salt = b"salt-bytes";
    let mut srp_server = MockSrpServer::new(b"Pair-Setup", pin.as_bytes(), salt);
    let server_public = srp_server.public_key();

    let m2 = TlvEncoder::new()
        .add_sequence(2)
        .add(TlvType::Salt, salt)
        .add(TlvType::PublicKey, &server_public)
        .build();

    let m3 = match client.process_m2(&m2).unwrap() {
        SetupStepResult::SendData(data) => data,
        _ => panic!("expected SendData for M3"),
    };

    let tlv_m3 = TlvDecoder::decode(&m3).unwrap();
    let client_public = tlv_m3.get_required(TlvType::PublicKey).unwrap();
    let client_proof = tlv_m3.get_required(TlvType::Proof).unwrap();

    let session_key = srp_server.verify_client(client_public, client_proof);

    let m4 = TlvEncoder::new()
        .add_sequence(4)
        .add(TlvType::Proof, srp_server.server_proof())
        .build();

    let _m5 = match client.process_m4(&m4).unwrap() {
        SetupStepResult::SendData(data) => data,
        _ => panic!("expected SendData for M5"),
    };

    let device_signing = Ed25519KeyPair::generate();
    let m6 = sign_m6(&session_key, b"device-id", &device_signing);

    match client.process_m6(&m6) {
        Ok(SetupStepResult::Complete(credential)) => {
            assert_eq!(
                &credential.primary.server_long_term_public,
                device_signing.public_key().as_bytes()
            );
            assert_eq!(credential.primary.server_identifier, "device-id");
            assert_eq!(credential.primary.client_identifier, "client-uuid");
        }
        other => panic!("expected Complete, got {other:?}"),
    }
}

#[test]
fn pair_setup_rejects_a_forged_m6_signature() {
    let mut client = PairSetup::new("client-uuid".to_string());
    let pin = "1234";
    client.set_pin(pin);
    let _m1 = client.start().unwrap();

    let salt = b"salt-bytes";
    let mut srp_server = MockSrpServer::new(b"Pair-Setup", pin.as_bytes(), salt);
    let m2 = TlvEncoder::new()
        .add_sequence(2)
        .add(TlvType::Salt, salt)
        .add(TlvType::PublicKey, &srp_server.public_key())
        .build();
    let m3 = match client.process_m2(&m2).unwrap() {
        SetupStepResult::SendData(d) => d,
        _ => panic!(),
    };
    let tlv_m3 = TlvDecoder::decode(&m3).unwrap();
    let session_key = srp_server.verify_client(
        tlv_m3.get_required(TlvType::PublicKey).unwrap(),
        tlv_m3.get_required(TlvType::Proof).unwrap(),
    );
    let m4 = TlvEncoder::new()
        .add_sequence(4)
        .add(TlvType::Proof, srp_server.server_proof())
        .build();
    let _m5 = client.process_m4(&m4).unwrap();

    // Device signs with a key that doesn't match the public key it claims.
    let device_signing = Ed25519KeyPair::generate();
    let bad_key = Ed25519KeyPair::generate();
    let m6 = sign_m6(&session_key, b"device-id", &bad_key);
    let _ = device_signing; // the forged signature is from bad_key, not device_signing

    let result = client.process_m6(&m6);
    assert!(matches!(result, Err(PairingError::CryptoError(_))));
}

#[test]
fn pair_setup_surfaces_a_device_error_code() {
    let mut setup = PairSetup::new("client-uuid".to_string());
    setup.set_pin("1234");
    let _ = setup.start().unwrap();

    let m2 = TlvEncoder::new()
        .add_sequence(2)
        .add_byte(TlvType::Error, errors::BUSY)
        .build();

    let result = setup.process_m2(&m2);
    assert!(matches!(result, Err(PairingError::DeviceError { code: 7 })));
}

fn sample_credential_half(client_long_term: &Ed25519KeyPair, device_long_term: &Ed25519KeyPair) -> CredentialHalf {
    CredentialHalf {
        client_identifier: "client-id".to_string(),
        client_long_term_private: client_long_term.secret_bytes(),
        client_long_term_public: *client_long_term.public_key().as_bytes(),
        server_long_term_public: *device_long_term.public_key().as_bytes(),
        server_identifier: "device-id".to_string(),
    }
}

#[test]
fn pair_verify_completes_and_derives_distinct_write_read_keys() {
    let client_long_term = Ed25519KeyPair::generate();
    let device_long_term = Ed25519KeyPair::generate();
    let credential = sample_credential_half(&client_long_term, &device_long_term);

    let mut client = PairVerify::new(PairVerifyVariant::AirPlay, &credential).unwrap();

    let m1 = client.start().unwrap();
    let tlv_m1 = TlvDecoder::decode(&m1).unwrap();
    let client_ephemeral_bytes = tlv_m1.get_required(TlvType::PublicKey).unwrap();
    let client_ephemeral = X25519PublicKey::from_bytes(client_ephemeral_bytes).unwrap();

    let device_ephemeral = X25519KeyPair::generate();
    let shared = device_ephemeral.diffie_hellman(&client_ephemeral);

    let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes());
    let session_key = hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info").unwrap();

    let mut sign_data = Vec::new();
    sign_data.extend_from_slice(device_ephemeral.public_key().as_bytes());
    sign_data.extend_from_slice(b"device-id");
    sign_data.extend_from_slice(client_ephemeral_bytes);
    let signature = device_long_term.sign(&sign_data);

    let inner_tlv = TlvEncoder::new()
        .add(TlvType::Identifier, b"device-id")
        .add(TlvType::Signature, &signature.to_bytes())
        .build();

    let cipher = ChaCha20Poly1305Cipher::new(&session_key).unwrap();
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(b"PV-Msg02");
    let nonce = Nonce::from_bytes(&nonce_bytes).unwrap();
    let encrypted = cipher.encrypt(&nonce, &inner_tlv).unwrap();

    let m2 = TlvEncoder::new()
        .add_sequence(2)
        .add(TlvType::PublicKey, device_ephemeral.public_key().as_bytes())
        .add(TlvType::EncryptedData, &encrypted)
        .build();

    let m3 = match client.process_m2(&m2).unwrap() {
        VerifyStepResult::SendData(data) => data,
        _ => panic!("expected SendData for M3"),
    };

    let tlv_m3 = TlvDecoder::decode(&m3).unwrap();
    let m3_encrypted = tlv_m3.get_required(TlvType::EncryptedData).unwrap();

    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(b"PV-Msg03");
    let nonce_m3 = Nonce::from_bytes(&nonce_bytes).unwrap();
    let decrypted_m3 = cipher.decrypt(&nonce_m3, m3_encrypted).unwrap();

    let tlv_inner = TlvDecoder::decode(&decrypted_m3).unwrap();
    let client_sig_bytes = tlv_inner.get_required(TlvType::Signature).unwrap();

    let mut verify_data = Vec::new();
    verify_data.extend_from_slice(client_ephemeral_bytes);
    verify_data.extend_from_slice(b"client-id");
    verify_data.extend_from_slice(device_ephemeral.public_key().as_bytes());
    let client_sig = Ed25519Signature::from_bytes(client_sig_bytes).unwrap();
    client_long_term.public_key().verify(&verify_data, &client_sig).unwrap();

    let m4 = TlvEncoder::new().add_sequence(4).build();

    match client.process_m4(&m4) {
        Ok(VerifyStepResult::Complete(keys)) => {
            assert_ne!(keys.write_key, keys.read_key);
        }
        other => panic!("expected Complete, got {other:?}"),
    }
}

#[test]
fn pair_verify_rejects_a_forged_device_signature() {
    let client_long_term = Ed25519KeyPair::generate();
    let device_long_term = Ed25519KeyPair::generate();
    let credential = sample_credential_half(&client_long_term, &device_long_term);

    let mut client = PairVerify::new(PairVerifyVariant::AirPlay, &credential).unwrap();
    let m1 = client.start().unwrap();
    let tlv_m1 = TlvDecoder::decode(&m1).unwrap();
    let client_ephemeral_bytes = tlv_m1.get_required(TlvType::PublicKey).unwrap();
    let client_ephemeral = X25519PublicKey::from_bytes(client_ephemeral_bytes).unwrap();

    let device_ephemeral = X25519KeyPair::generate();
    let shared = device_ephemeral.diffie_hellman(&client_ephemeral);
    let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes());
    let session_key = hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info").unwrap();

    let mut sign_data = Vec::new();
    sign_data.extend_from_slice(device_ephemeral.public_key().as_bytes());
    sign_data.extend_from_slice(client_ephemeral_bytes);

    let bad_key = Ed25519KeyPair::generate();
    let signature = bad_key.sign(&sign_data);

    let inner_tlv = TlvEncoder::new()
        .add(TlvType::Identifier, b"device-id")
        .add(TlvType::Signature, &signature.to_bytes())
        .build();

    let cipher = ChaCha20Poly1305Cipher::new(&session_key).unwrap();
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(b"PV-Msg02");
    let nonce = Nonce::from_bytes(&nonce_bytes).unwrap();
    let encrypted = cipher.encrypt(&nonce, &inner_tlv).unwrap();

    let m2 = TlvEncoder::new()
        .add_sequence(2)
        .add(TlvType::PublicKey, device_ephemeral.public_key().as_bytes())
        .add(TlvType::EncryptedData, &encrypted)
        .build();

    let result = client.process_m2(&m2);
    assert!(matches!(result, Err(PairingError::CryptoError(_))));
}

#[test]
fn pair_verify_companion_variant_uses_empty_salt_labels() {
    let client_long_term = Ed25519KeyPair::generate();
    let device_long_term = Ed25519KeyPair::generate();
    let credential = sample_credential_half(&client_long_term, &device_long_term);

    let mut client = PairVerify::new(PairVerifyVariant::Companion, &credential).unwrap();
    let m1 = client.start().unwrap();
    let tlv_m1 = TlvDecoder::decode(&m1).unwrap();
    let client_ephemeral_bytes = tlv_m1.get_required(TlvType::PublicKey).unwrap();
    let client_ephemeral = X25519PublicKey::from_bytes(client_ephemeral_bytes).unwrap();

    let device_ephemeral = X25519KeyPair::generate();
    let shared = device_ephemeral.diffie_hellman(&client_ephemeral);
    let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes());
    let session_key = hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info").unwrap();

    let mut sign_data = Vec::new();
    sign_data.extend_from_slice(device_ephemeral.public_key().as_bytes());
    sign_data.extend_from_slice(b"device-id");
    sign_data.extend_from_slice(client_ephemeral_bytes);
    let signature = device_long_term.sign(&sign_data);

    let inner_tlv = TlvEncoder::new()
        .add(TlvType::Identifier, b"device-id")
        .add(TlvType::Signature, &signature.to_bytes())
        .build();

    let cipher = ChaCha20Poly1305Cipher::new(&session_key).unwrap();
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(b"PV-Msg02");
    let nonce = Nonce::from_bytes(&nonce_bytes).unwrap();
    let encrypted = cipher.encrypt(&nonce, &inner_tlv).unwrap();

    let m2 = TlvEncoder::new()
        .add_sequence(2)
        .add(TlvType::PublicKey, device_ephemeral.public_key().as_bytes())
        .add(TlvType::EncryptedData, &encrypted)
        .build();

    let _m3 = client.process_m2(&m2).unwrap();
    let m4 = TlvEncoder::new().add_sequence(4).build();

    let expected = HkdfSha512::new(None, shared.as_bytes());
    let expected_write = expected.expand_fixed::<32>(b"ClientEncrypt-main").unwrap();
    let expected_read = expected.expand_fixed::<32>(b"ServerEncrypt-main").unwrap();

    match client.process_m4(&m4) {
        Ok(VerifyStepResult::Complete(keys)) => {
            assert_eq!(keys.write_key, expected_write);
            assert_eq!(keys.read_key, expected_read);
        }
        other => panic!("expected Complete, got {other:?}"),
    }
}
