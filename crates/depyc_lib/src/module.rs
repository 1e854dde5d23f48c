use std::rc::Rc;

use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::marshal::{self, Code, Loader, PyString, Value};
use crate::reader::Reader;
use crate::version::{self, PyVersion};
use crate::DepycError;

/// A loaded `.pyc` container.
#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub version: PyVersion,
    pub unicode: bool,
    pub timestamp: u32,
    pub source_size: Option<u32>,
    pub interns: Vec<PyString>,
    pub code: Rc<Code>,
}

impl Module {
    pub fn parse(bytes: &[u8]) -> Result<Self, DepycError> {
        let mut reader = Reader::new(bytes);
        let magic = reader.get_u32()?;
        let (version, unicode) = version::lookup_magic(magic).ok_or(DepycError::BadMagic(magic))?;
        let timestamp = reader.get_u32()?;
        let source_size = if version::features(version).header_size_field {
            Some(reader.get_u32()?)
        } else {
            None
        };

        let mut loader = Loader::new(reader, version);
        let code = match loader.read_value()? {
            Value::Code(code) => code,
            _ => return Err(DepycError::NotCode),
        };
        if !loader.reader().at_eof() {
            tracing::debug!(
                trailing = loader.reader().remaining(),
                "trailing bytes after top-level code object"
            );
        }

        Ok(Self {
            version,
            unicode,
            timestamp,
            source_size,
            interns: loader.interns().to_vec(),
            code,
        })
    }

    /// Wraps a code object in a fresh container for `version`.
    pub fn new(version: PyVersion, unicode: bool, code: Code) -> Self {
        Self {
            version,
            unicode: unicode || version.major >= 3,
            timestamp: 0,
            source_size: version::features(version).header_size_field.then_some(0),
            interns: Vec::new(),
            code: Rc::new(code),
        }
    }

    /// Serializes the container, header included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DepycError> {
        let magic = version::magic_for(self.version, self.unicode)
            .ok_or(DepycError::BadMagic(0))?;
        let mut out = Vec::new();
        let _ = out.write_u32::<LittleEndian>(magic);
        let _ = out.write_u32::<LittleEndian>(self.timestamp);
        if version::features(self.version).header_size_field {
            let _ = out.write_u32::<LittleEndian>(self.source_size.unwrap_or(0));
        }
        out.extend(marshal::dump_value(
            &Value::Code(self.code.clone()),
            self.version,
        ));
        Ok(out)
    }

    /// `Python 2.7`, with `unicode_suffix` appended in 2.x unicode-literal mode.
    pub fn version_label(&self, unicode_suffix: &str) -> String {
        let suffix = if self.unicode && self.version.major < 3 {
            unicode_suffix
        } else {
            ""
        };
        format!("Python {}{}", self.version, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_magic() {
        let err = Module::parse(&[1, 2, 3, 4, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DepycError::BadMagic(0x0403_0201)));
    }

    #[test]
    fn header_size_field_only_from_33() {
        for (version, header) in [(PyVersion::new(3, 2), 8), (PyVersion::new(3, 3), 12)] {
            let module = Module::new(version, true, Code::default());
            let bytes = module.to_bytes().unwrap();
            assert_eq!(bytes[header], b'c', "{version}");
            let back = Module::parse(&bytes).unwrap();
            assert_eq!(back.version, version);
            assert!(back.unicode);
        }
    }

    #[test]
    fn top_level_must_be_code() {
        let mut bytes = 0x0A0D_F303u32.to_le_bytes().to_vec();
        bytes.extend([0, 0, 0, 0, b'N']);
        assert!(matches!(Module::parse(&bytes), Err(DepycError::NotCode)));
    }

    #[test]
    fn unicode_magic_sets_flag() {
        let module = Module::new(PyVersion::new(2, 7), true, Code::default());
        let back = Module::parse(&module.to_bytes().unwrap()).unwrap();
        assert!(back.unicode);
        assert_eq!(back.version_label(" Unicode"), "Python 2.7 Unicode");
    }
}
