//! Reading and writing `verification-metadata.xml`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use modvault_schema::{ChecksumKind, ModuleComponentId};
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tempfile::NamedTempFile;
use thiserror::Error;

use super::model::{
    ArtifactVerificationMetadata, DependencyVerifier, DependencyVerifierBuilder, IgnoredKey,
    TrustedArtifact, TrustedKey,
};

/// XML namespace of the manifest.
pub const NAMESPACE: &str = "https://modvault.dev/schema/dependency-verification";
const INDENT: usize = 3;

/// Failures reading or writing a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The manifest file could not be read or replaced.
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The document is not well-formed XML.
    #[error("Invalid XML: {0}")]
    Xml(#[from] quick_xml::Error),

    /// An attribute is malformed.
    #[error("Invalid XML attribute: {0}")]
    Attribute(#[from] AttrError),

    /// Serializing the manifest failed.
    #[error("Failed to encode manifest: {0}")]
    Encode(#[from] std::io::Error),

    /// Well-formed XML that is not a valid manifest.
    #[error("Invalid verification metadata: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ManifestError {
    ManifestError::Invalid(msg.into())
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, ManifestError> {
        let mut element = Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            ..Self::default()
        };
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, name: &str) -> Result<&str, ManifestError> {
        self.attr(name)
            .ok_or_else(|| invalid(format!("<{}> is missing the '{name}' attribute", self.name)))
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn bool_text(&self) -> Result<bool, ManifestError> {
        match self.text.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(invalid(format!("<{}> expects true or false, got '{other}'", self.name))),
        }
    }
}

fn parse_tree(text: &str) -> Result<Element, ManifestError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    loop {
        let finished = match reader.read_event()? {
            Event::Start(start) => {
                stack.push(Element::from_start(&start)?);
                None
            }
            Event::Empty(start) => Some(Element::from_start(&start)?),
            Event::End(_) => Some(stack.pop().ok_or_else(|| invalid("unbalanced end tag"))?),
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
                None
            }
            Event::Eof => break,
            _ => None,
        };
        if let Some(element) = finished {
            match stack.last_mut() {
                Some(parent) => parent.children.push(element),
                None if root.is_none() => root = Some(element),
                None => return Err(invalid("more than one root element")),
            }
        }
    }
    if !stack.is_empty() {
        return Err(invalid("unclosed element"));
    }
    root.ok_or_else(|| invalid("empty document"))
}

fn scope_of(element: &Element) -> TrustedArtifact {
    TrustedArtifact {
        group: element.attr("group").map(ToString::to_string),
        name: element.attr("name").map(ToString::to_string),
        version: element.attr("version").map(ToString::to_string),
        file: element.attr("file").map(ToString::to_string),
        regex: element.attr("regex") == Some("true"),
        reason: element.attr("reason").map(ToString::to_string),
    }
}

fn read_configuration(
    config: &Element,
    builder: &mut DependencyVerifierBuilder,
) -> Result<(), ManifestError> {
    for child in &config.children {
        match child.name.as_str() {
            "verify-metadata" => builder.set_verify_metadata(child.bool_text()?),
            "verify-signatures" => builder.set_verify_signatures(child.bool_text()?),
            "key-servers" => {
                builder.set_use_key_servers(child.attr("enabled") != Some("false"));
                for server in child.children_named("key-server") {
                    builder.add_key_server(server.required("uri")?);
                }
            }
            "keyring-format" => builder.set_keyring_format(Some(child.text.trim().to_string())),
            "trusted-artifacts" => {
                for trust in child.children_named("trust") {
                    builder.add_trusted_artifact(scope_of(trust));
                }
            }
            "ignored-keys" => {
                for key in child.children_named("ignored-key") {
                    builder.add_ignored_key(IgnoredKey::new(key.required("id")?, key.attr("reason")));
                }
            }
            "trusted-keys" => {
                for key in child.children_named("trusted-key") {
                    let id = key.required("id")?;
                    let nested: Vec<&Element> = key.children_named("trusting").collect();
                    if nested.is_empty() {
                        builder.add_trusted_key(TrustedKey {
                            key_id: id.to_string(),
                            trusting: scope_of(key),
                        });
                    }
                    for trusting in nested {
                        builder.add_trusted_key(TrustedKey {
                            key_id: id.to_string(),
                            trusting: scope_of(trusting),
                        });
                    }
                }
            }
            other => tracing::warn!("Ignoring unknown configuration element <{other}>"),
        }
    }
    Ok(())
}

fn read_artifact(
    component: &ModuleComponentId,
    artifact: &Element,
    builder: &mut DependencyVerifierBuilder,
) -> Result<(), ManifestError> {
    let file = artifact.required("name")?;
    for child in &artifact.children {
        match child.name.as_str() {
            "pgp" => builder.add_trusted_pgp_key(component, file, child.required("value")?),
            "ignored-keys" => {
                for key in child.children_named("ignored-key") {
                    builder.add_ignored_pgp_key(
                        component,
                        file,
                        IgnoredKey::new(key.required("id")?, key.attr("reason")),
                    );
                }
            }
            name => {
                let kind = ChecksumKind::from_str(name).map_err(|e| invalid(e.to_string()))?;
                builder.add_checksum(
                    component,
                    file,
                    kind,
                    child.required("value")?,
                    child.attr("origin"),
                    child.attr("reason"),
                );
                for also in child.children_named("also-trust") {
                    builder.add_checksum(component, file, kind, also.required("value")?, None, None);
                }
            }
        }
    }
    Ok(())
}

/// Parse a manifest into a builder.
///
/// # Errors
///
/// Fails on malformed XML or on elements missing required attributes.
pub fn read_manifest(text: &str) -> Result<DependencyVerifierBuilder, ManifestError> {
    let root = parse_tree(text)?;
    if root.name != "verification-metadata" {
        return Err(invalid(format!("unexpected root element <{}>", root.name)));
    }
    let mut builder = DependencyVerifierBuilder::new();
    for child in &root.children {
        match child.name.as_str() {
            "configuration" => read_configuration(child, &mut builder)?,
            "components" => {
                for component in child.children_named("component") {
                    let id = ModuleComponentId::new(
                        component.required("group")?,
                        component.required("name")?,
                        component.required("version")?,
                    );
                    for artifact in component.children_named("artifact") {
                        read_artifact(&id, artifact, &mut builder)?;
                    }
                }
            }
            other => tracing::warn!("Ignoring unknown element <{other}>"),
        }
    }
    Ok(builder)
}

/// Read the manifest at `path`; an absent file is an empty builder.
///
/// # Errors
///
/// Fails when the file exists but cannot be read or parsed.
pub fn read_manifest_file(path: &Path) -> Result<DependencyVerifierBuilder, ManifestError> {
    match fs::read_to_string(path) {
        Ok(text) => read_manifest(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DependencyVerifierBuilder::new()),
        Err(source) => Err(ManifestError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn tag<'a>(name: &'a str, attributes: &[(&'a str, Option<&'a str>)]) -> BytesStart<'a> {
        let mut start = BytesStart::new(name);
        for (key, value) in attributes {
            if let Some(value) = value {
                start.push_attribute((*key, *value));
            }
        }
        start
    }

    fn start(&mut self, name: &str, attributes: &[(&str, Option<&str>)]) -> Result<(), ManifestError> {
        self.writer.write_event(Event::Start(Self::tag(name, attributes)))?;
        Ok(())
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, Option<&str>)]) -> Result<(), ManifestError> {
        self.writer.write_event(Event::Empty(Self::tag(name, attributes)))?;
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<(), ManifestError> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<(), ManifestError> {
        self.start(name, &[])?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }
}

fn scope_attributes(scope: &TrustedArtifact) -> Vec<(&str, Option<&str>)> {
    vec![
        ("group", scope.group.as_deref()),
        ("name", scope.name.as_deref()),
        ("version", scope.version.as_deref()),
        ("file", scope.file.as_deref()),
        ("regex", scope.regex.then_some("true")),
    ]
}

fn write_configuration(out: &mut XmlOut, verifier: &DependencyVerifier) -> Result<(), ManifestError> {
    let config = verifier.configuration();
    out.start("configuration", &[])?;
    out.text_element("verify-metadata", bool_str(config.verify_metadata))?;
    out.text_element("verify-signatures", bool_str(config.verify_signatures))?;

    let enabled = [("enabled", Some(bool_str(config.use_key_servers)))];
    if config.key_servers.is_empty() {
        if !config.use_key_servers {
            out.empty("key-servers", &enabled)?;
        }
    } else {
        out.start("key-servers", &enabled)?;
        for uri in &config.key_servers {
            out.empty("key-server", &[("uri", Some(uri.as_str()))])?;
        }
        out.end("key-servers")?;
    }

    if let Some(format) = &config.keyring_format {
        out.text_element("keyring-format", format)?;
    }

    if !config.trusted_artifacts.is_empty() {
        out.start("trusted-artifacts", &[])?;
        for trust in &config.trusted_artifacts {
            let mut attributes = scope_attributes(trust);
            attributes.push(("reason", trust.reason.as_deref()));
            out.empty("trust", &attributes)?;
        }
        out.end("trusted-artifacts")?;
    }

    if !config.ignored_keys.is_empty() {
        out.start("ignored-keys", &[])?;
        for key in &config.ignored_keys {
            out.empty(
                "ignored-key",
                &[("id", Some(key.key_id.as_str())), ("reason", key.reason.as_deref())],
            )?;
        }
        out.end("ignored-keys")?;
    }

    if !config.trusted_keys.is_empty() {
        let mut by_key: BTreeMap<&str, Vec<&TrustedArtifact>> = BTreeMap::new();
        for key in &config.trusted_keys {
            by_key.entry(&key.key_id).or_default().push(&key.trusting);
        }
        out.start("trusted-keys", &[])?;
        for (id, scopes) in by_key {
            if let [scope] = scopes.as_slice() {
                let mut attributes = vec![("id", Some(id))];
                attributes.extend(scope_attributes(scope));
                out.empty("trusted-key", &attributes)?;
            } else {
                out.start("trusted-key", &[("id", Some(id))])?;
                for scope in scopes {
                    out.empty("trusting", &scope_attributes(scope))?;
                }
                out.end("trusted-key")?;
            }
        }
        out.end("trusted-keys")?;
    }

    out.end("configuration")
}

fn write_artifact(out: &mut XmlOut, artifact: &ArtifactVerificationMetadata) -> Result<(), ManifestError> {
    let name = [("name", Some(artifact.file_name.as_str()))];
    if artifact.checksums.is_empty()
        && artifact.trusted_pgp_keys.is_empty()
        && artifact.ignored_pgp_keys.is_empty()
    {
        return out.empty("artifact", &name);
    }
    out.start("artifact", &name)?;
    if !artifact.ignored_pgp_keys.is_empty() {
        out.start("ignored-keys", &[])?;
        for key in &artifact.ignored_pgp_keys {
            out.empty(
                "ignored-key",
                &[("id", Some(key.key_id.as_str())), ("reason", key.reason.as_deref())],
            )?;
        }
        out.end("ignored-keys")?;
    }
    for key in &artifact.trusted_pgp_keys {
        out.empty("pgp", &[("value", Some(key.as_str()))])?;
    }
    for checksum in artifact.checksums.values() {
        let tag = checksum.kind.as_str();
        let attributes = [
            ("value", Some(checksum.value.as_str())),
            ("origin", checksum.origin.as_deref()),
            ("reason", checksum.reason.as_deref()),
        ];
        if checksum.alternatives.is_empty() {
            out.empty(tag, &attributes)?;
        } else {
            out.start(tag, &attributes)?;
            for also in &checksum.alternatives {
                out.empty("also-trust", &[("value", Some(also.as_str()))])?;
            }
            out.end(tag)?;
        }
    }
    out.end("artifact")
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Render `verifier` as a manifest document.
///
/// # Errors
///
/// Only fails if the XML writer does.
pub fn write_manifest(verifier: &DependencyVerifier) -> Result<String, ManifestError> {
    let mut out = XmlOut {
        writer: Writer::new_with_indent(Vec::new(), b' ', INDENT),
    };
    out.writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    out.start("verification-metadata", &[("xmlns", Some(NAMESPACE))])?;
    write_configuration(&mut out, verifier)?;

    out.start("components", &[])?;
    for component in verifier.components() {
        let id = &component.component;
        out.start(
            "component",
            &[
                ("group", Some(id.group.as_str())),
                ("name", Some(id.module.as_str())),
                ("version", Some(id.version.as_str())),
            ],
        )?;
        for artifact in component.artifacts.values() {
            write_artifact(&mut out, artifact)?;
        }
        out.end("component")?;
    }
    out.end("components")?;
    out.end("verification-metadata")?;

    let mut text = String::from_utf8(out.writer.into_inner())
        .map_err(|e| invalid(format!("writer produced invalid UTF-8: {e}")))?;
    text.push('\n');
    Ok(text)
}

/// Write the manifest to `path`, replacing it atomically.
///
/// # Errors
///
/// Fails when the directory or file cannot be written.
pub fn write_manifest_file(path: &Path, verifier: &DependencyVerifier) -> Result<(), ManifestError> {
    let text = write_manifest(verifier)?;
    let io_err = |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(text.as_bytes()).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<verification-metadata xmlns="https://modvault.dev/schema/dependency-verification">
   <configuration>
      <verify-metadata>false</verify-metadata>
      <verify-signatures>true</verify-signatures>
      <key-servers enabled="false">
         <key-server uri="https://keys.example.com"/>
      </key-servers>
      <keyring-format>text</keyring-format>
      <trusted-artifacts>
         <trust group="org\.internal(\..*)?" regex="true" reason="built in-house"/>
      </trusted-artifacts>
      <ignored-keys>
         <ignored-key id="ABCDEF0123456789" reason="Key couldn't be downloaded from any key server"/>
      </ignored-keys>
      <trusted-keys>
         <trusted-key id="1111111111111111111111111111111111111111" group="org.a"/>
         <trusted-key id="2222222222222222222222222222222222222222">
            <trusting group="org.b"/>
            <trusting group="org.c" name="lib"/>
         </trusted-key>
      </trusted-keys>
   </configuration>
   <components>
      <component group="org.example" name="lib" version="1.0">
         <artifact name="lib-1.0.jar">
            <ignored-keys>
               <ignored-key id="3333333333333333" reason="PGP verification failed"/>
            </ignored-keys>
            <pgp value="4444444444444444444444444444444444444444"/>
            <sha256 value="aa" origin="Generated by modvault" reason="PGP signature verification failed!">
               <also-trust value="bb"/>
            </sha256>
         </artifact>
      </component>
   </components>
</verification-metadata>
"#;

    #[test]
    fn reads_every_section() {
        let verifier = read_manifest(SAMPLE).unwrap().build();
        let config = verifier.configuration();
        assert!(!config.verify_metadata);
        assert!(config.verify_signatures);
        assert!(!config.use_key_servers);
        assert_eq!(config.key_servers, ["https://keys.example.com"]);
        assert_eq!(config.keyring_format.as_deref(), Some("text"));
        assert!(config.trusted_artifacts[0].regex);
        assert_eq!(config.ignored_keys.len(), 1);
        assert_eq!(config.trusted_keys.len(), 3);

        let component = verifier.components().next().unwrap();
        let artifact = &component.artifacts["lib-1.0.jar"];
        assert_eq!(artifact.trusted_pgp_keys.len(), 1);
        assert_eq!(artifact.ignored_pgp_keys.first().unwrap().reason.as_deref(), Some("PGP verification failed"));
        let sha = &artifact.checksums[&ChecksumKind::Sha256];
        assert_eq!(sha.value, "aa");
        assert!(sha.alternatives.contains("bb"));
        assert_eq!(sha.reason.as_deref(), Some("PGP signature verification failed!"));
    }

    #[test]
    fn rewrite_is_equivalent() {
        let first = read_manifest(SAMPLE).unwrap().build();
        let text = write_manifest(&first).unwrap();
        let second = read_manifest(&text).unwrap().build();
        assert_eq!(first, second);
        assert_eq!(write_manifest(&second).unwrap(), text);
    }

    #[test]
    fn writer_layout() {
        let mut builder = DependencyVerifierBuilder::new();
        builder.add_checksum(
            &ModuleComponentId::new("g", "m", "1"),
            "m-1.jar",
            ChecksumKind::Sha256,
            "abc",
            Some("Generated by modvault"),
            None,
        );
        let text = write_manifest(&builder.build()).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<verification-metadata xmlns=\""));
        assert!(text.contains("\n   <configuration>\n      <verify-metadata>true</verify-metadata>\n"));
        assert!(text.contains(
            "         <artifact name=\"m-1.jar\">\n            <sha256 value=\"abc\" origin=\"Generated by modvault\"/>\n"
        ));
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(matches!(read_manifest("<other/>"), Err(ManifestError::Invalid(_))));
        assert!(read_manifest("<verification-metadata>").is_err());
        assert!(matches!(
            read_manifest("<verification-metadata><components><component group=\"g\"/></components></verification-metadata>"),
            Err(ManifestError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let builder = read_manifest_file(&dir.path().join("verification-metadata.xml")).unwrap();
        assert_eq!(builder.build(), DependencyVerifier::default());
    }
}
