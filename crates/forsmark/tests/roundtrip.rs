//! Outbound-then-inbound round trips: a document signed or encrypted by
//! the writer verifies and decrypts through the reader.

use forsmark::core::{Error, QName};
use forsmark::stream::{
    reader, Action, InboundXmlSec, KeyMaterial, OutboundXmlSec, SecurePart,
    XmlSecurityProperties,
};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_outbound(props: XmlSecurityProperties, xml: &str) -> String {
    let outbound = OutboundXmlSec::new(props).expect("outbound config");
    let buf = SharedBuf::default();
    let mut writer = outbound.process(Box::new(buf.clone())).expect("writer");
    writer
        .write_all(reader::events_from_str(xml).expect("parse input"))
        .expect("write events");
    writer.close().expect("close");
    let bytes = buf.0.borrow().clone();
    String::from_utf8(bytes).expect("utf8 output")
}

fn sign_props(key: KeyMaterial, part: &str) -> XmlSecurityProperties {
    let mut props = XmlSecurityProperties::new();
    props.actions.push(Action::Sign);
    props.signature_key = Some(key);
    props.signature_parts.push(SecurePart::new(QName::new("", part)));
    props
}

fn verify_props(key: KeyMaterial) -> XmlSecurityProperties {
    let mut props = XmlSecurityProperties::new();
    props.signature_verification_key = Some(key);
    props
}

#[test]
fn test_hmac_sign_verify_roundtrip() {
    let key = vec![0x6bu8; 32];
    let signed = run_outbound(
        sign_props(KeyMaterial::symmetric(key.clone()), "invoice"),
        "<invoice><amount>42</amount></invoice>",
    );
    assert!(signed.contains("<ds:Signature"));
    assert!(signed.contains("hmac-sha1"));

    let inbound = InboundXmlSec::new(verify_props(KeyMaterial::symmetric(key))).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(&signed).unwrap())
        .unwrap();
    sec_reader.read_to_end().expect("verification");

    assert!(sec_reader.verified());
    let results = sec_reader.verification_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].references.len(), 1);
    assert!(results[0].references[0].digest_ok);
    assert!(results[0].references[0].uri.starts_with('#'));
}

#[test]
fn test_rsa_sign_verify_roundtrip() {
    let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public = private.to_public_key();

    let signed = run_outbound(
        sign_props(KeyMaterial::rsa_private(private), "doc"),
        "<doc><body>content</body></doc>",
    );
    // The signature algorithm derives from the key class.
    assert!(signed.contains("rsa-sha1"));

    let inbound = InboundXmlSec::new(verify_props(KeyMaterial::rsa_public(public))).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(&signed).unwrap())
        .unwrap();
    sec_reader.read_to_end().expect("verification");
    assert!(sec_reader.verified());
}

#[test]
fn test_tampered_content_fails_digest() {
    let key = vec![0x6bu8; 32];
    // The marker contains a space, so it cannot collide with base64
    // signature or digest text.
    let signed = run_outbound(
        sign_props(KeyMaterial::symmetric(key.clone()), "invoice"),
        "<invoice><amount>amount 42</amount></invoice>",
    );
    let tampered = signed.replace("amount 42", "amount 43");
    assert_ne!(signed, tampered);

    let inbound = InboundXmlSec::new(verify_props(KeyMaterial::symmetric(key))).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(&tampered).unwrap())
        .unwrap();
    let err = sec_reader.read_to_end().unwrap_err();
    assert!(matches!(err, Error::DigestMismatch(_)));
}

#[test]
fn test_tampered_signed_info_fails_signature() {
    let key = vec![0x6bu8; 32];
    let signed = run_outbound(
        sign_props(KeyMaterial::symmetric(key.clone()), "invoice"),
        "<invoice><amount>42</amount></invoice>",
    );
    // Swap the digest algorithm inside SignedInfo: the digest value no
    // longer matches what SignedInfo was signed over.
    let tampered = signed.replace(
        "http://www.w3.org/2000/09/xmldsig#sha1",
        "http://www.w3.org/2001/04/xmlenc#sha256",
    );
    assert_ne!(signed, tampered);

    let inbound = InboundXmlSec::new(verify_props(KeyMaterial::symmetric(key))).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(&tampered).unwrap())
        .unwrap();
    let err = sec_reader.read_to_end().unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid(_)));
}

#[test]
fn test_wrong_hmac_key_fails_signature() {
    let signed = run_outbound(
        sign_props(KeyMaterial::symmetric(vec![0x6bu8; 32]), "invoice"),
        "<invoice>x</invoice>",
    );
    let inbound =
        InboundXmlSec::new(verify_props(KeyMaterial::symmetric(vec![0x11u8; 32]))).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(&signed).unwrap())
        .unwrap();
    assert!(matches!(
        sec_reader.read_to_end().unwrap_err(),
        Error::SignatureInvalid(_)
    ));
}

fn encrypt_props(key: KeyMaterial, part: &str) -> XmlSecurityProperties {
    let mut props = XmlSecurityProperties::new();
    props.actions.push(Action::Encrypt);
    props.encryption_key = Some(key);
    props.encryption_parts.push(SecurePart::new(QName::new("", part)));
    props
}

fn decrypt_and_collect(xml: &str, key: KeyMaterial) -> Vec<forsmark::core::XmlSecEvent> {
    let mut props = XmlSecurityProperties::new();
    props.decryption_key = Some(key);
    let inbound = InboundXmlSec::new(props).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(xml).unwrap())
        .unwrap();
    sec_reader.read_to_end().expect("decryption")
}

#[test]
fn test_encrypt_decrypt_roundtrip_rsa_transport() {
    let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public = private.to_public_key();

    let encrypted = run_outbound(
        encrypt_props(KeyMaterial::rsa_public(public), "secret"),
        "<doc><secret>top secret payload</secret><open>visible</open></doc>",
    );
    assert!(encrypted.contains("EncryptedData"));
    assert!(encrypted.contains("rsa-oaep-mgf1p"));
    assert!(encrypted.contains("aes256-cbc"));
    assert!(!encrypted.contains("top secret payload"));

    let events = decrypt_and_collect(&encrypted, KeyMaterial::rsa_private(private));
    let names: Vec<String> = events
        .iter()
        .filter_map(|e| e.as_start_element())
        .map(|d| d.name.local_name.clone())
        .collect();
    assert_eq!(names, vec!["doc", "secret", "open"]);
    assert!(events.iter().any(|e| matches!(
        e,
        forsmark::core::XmlSecEvent::Characters { text } if text == "top secret payload"
    )));
}

#[test]
fn test_encrypt_decrypt_roundtrip_symmetric_kek() {
    let kek = vec![0x2cu8; 16];
    let encrypted = run_outbound(
        encrypt_props(KeyMaterial::symmetric(kek.clone()), "secret"),
        "<doc><secret attr=\"v\">data &amp; more</secret></doc>",
    );
    assert!(encrypted.contains("kw-aes128"));

    let events = decrypt_and_collect(&encrypted, KeyMaterial::symmetric(kek));
    let secret = events
        .iter()
        .filter_map(|e| e.as_start_element())
        .find(|d| d.name.local_name == "secret")
        .expect("secret element recovered");
    assert_eq!(secret.attribute("attr"), Some("v"));
    assert!(events.iter().any(|e| matches!(
        e,
        forsmark::core::XmlSecEvent::Characters { text } if text == "data & more"
    )));
}

#[test]
fn test_sign_then_encrypt_then_verify() {
    // Both actions on one pass: the signed part is encrypted afterwards,
    // and the inbound side decrypts before verifying.
    let hmac_key = vec![0x5eu8; 32];
    let kek = vec![0x2cu8; 32];

    let mut props = XmlSecurityProperties::new();
    props.actions.push(Action::Sign);
    props.actions.push(Action::Encrypt);
    props.signature_key = Some(KeyMaterial::symmetric(hmac_key.clone()));
    props
        .signature_parts
        .push(SecurePart::new(QName::new("", "payload")));
    props.encryption_key = Some(KeyMaterial::symmetric(kek.clone()));
    props
        .encryption_parts
        .push(SecurePart::new(QName::new("", "payload")));

    let protected = run_outbound(props, "<env><payload>ledger</payload></env>");
    assert!(protected.contains("EncryptedData"));
    assert!(!protected.contains("ledger"));

    let mut inbound_props = XmlSecurityProperties::new();
    inbound_props.signature_verification_key = Some(KeyMaterial::symmetric(hmac_key));
    inbound_props.decryption_key = Some(KeyMaterial::symmetric(kek));
    let inbound = InboundXmlSec::new(inbound_props).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(&protected).unwrap())
        .unwrap();
    let events = sec_reader.read_to_end().expect("decrypt and verify");

    assert!(sec_reader.verified());
    assert!(events.iter().any(|e| matches!(
        e,
        forsmark::core::XmlSecEvent::Characters { text } if text == "ledger"
    )));
}
