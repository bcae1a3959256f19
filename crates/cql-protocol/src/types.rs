//! `ColumnType` is the canonical, language-agnostic description of a CQL
//! type, independent of the server's internal class-name spelling.
//! [`ColumnType::parse_class_name`] parses
//! the server's nested class-name strings, e.g.
//! `SetType(org.apache.cassandra.db.marshal.UTF8Type)` or
//! `UserType(ks,757365725f74797065,6669656c64:org.apache.cassandra.db.marshal.Int32Type)`.

use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Ascii,
    Varchar,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Varint,
    Decimal,
    Float,
    Double,
    Boolean,
    Timestamp,
    Date,
    Time,
    Duration,
    Uuid,
    TimeUuid,
    Inet,
    Blob,
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Tuple(Vec<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Vector(Box<ColumnType>, u32),
}

impl ColumnType {
    /// True for types whose encoded form is not a fixed width (collections,
    /// tuples, udts, text/blob, and variable-length scalars like varint).
    pub fn is_variable_width(&self) -> bool {
        !matches!(
            self,
            ColumnType::TinyInt
                | ColumnType::SmallInt
                | ColumnType::Int
                | ColumnType::BigInt
                | ColumnType::Float
                | ColumnType::Double
                | ColumnType::Boolean
                | ColumnType::Timestamp
                | ColumnType::Date
                | ColumnType::Time
                | ColumnType::Uuid
                | ColumnType::TimeUuid
        )
    }

    /// Parses the server's fully-qualified marshal class-name representation
    /// of a type, handling arbitrary nesting of collections/tuples/UDTs.
    pub fn parse_class_name(s: &str) -> Result<ColumnType, CodecError> {
        let mut parser = ClassNameParser { input: s, pos: 0 };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(CodecError::UnknownType(s.to_string()));
        }
        Ok(ty)
    }
}

struct ClassNameParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ClassNameParser<'a> {
    fn skip_ws(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<(), CodecError> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(CodecError::UnknownType(self.input.to_string()))
        }
    }

    /// Reads a bare identifier: up to the next `,` `(` `)` `:` or end of input.
    fn read_ident(&mut self) -> &'a str {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ',' || c == '(' || c == ')' || c == ':' {
                break;
            }
            self.pos += c.len_utf8();
        }
        self.input[start..self.pos].trim_end()
    }

    fn parse_type(&mut self) -> Result<ColumnType, CodecError> {
        self.skip_ws();
        let ident = self.read_ident();
        self.skip_ws();

        if self.peek() != Some('(') {
            return scalar_from_class_name(ident);
        }
        self.pos += 1; // consume '('

        let ty = match last_component(ident) {
            "ListType" => {
                let elem = self.parse_type()?;
                ColumnType::List(Box::new(elem))
            }
            "SetType" => {
                let elem = self.parse_type()?;
                ColumnType::Set(Box::new(elem))
            }
            "MapType" => {
                let key = self.parse_type()?;
                self.expect(',')?;
                let val = self.parse_type()?;
                ColumnType::Map(Box::new(key), Box::new(val))
            }
            "TupleType" => {
                let mut fields = Vec::new();
                fields.push(self.parse_type()?);
                self.skip_ws();
                while self.peek() == Some(',') {
                    self.pos += 1;
                    fields.push(self.parse_type()?);
                    self.skip_ws();
                }
                ColumnType::Tuple(fields)
            }
            "VectorType" => {
                let elem = self.parse_type()?;
                self.expect(',')?;
                self.skip_ws();
                let dim = self.read_ident();
                let dim: u32 = dim
                    .trim()
                    .parse()
                    .map_err(|_| CodecError::UnknownType(self.input.to_string()))?;
                ColumnType::Vector(Box::new(elem), dim)
            }
            "UserType" => {
                self.skip_ws();
                let keyspace = self.read_ident().to_string();
                self.expect(',')?;
                let name_hex = self.read_ident();
                let name = hex_decode_to_string(name_hex)?;
                let mut fields = Vec::new();
                self.skip_ws();
                while self.peek() == Some(',') {
                    self.pos += 1;
                    self.skip_ws();
                    let field_hex = {
                        let start = self.pos;
                        while let Some(c) = self.peek() {
                            if c == ':' {
                                break;
                            }
                            self.pos += c.len_utf8();
                        }
                        self.input[start..self.pos].trim_end()
                    };
                    self.expect(':')?;
                    let field_name = hex_decode_to_string(field_hex)?;
                    let field_ty = self.parse_type()?;
                    fields.push((field_name, field_ty));
                    self.skip_ws();
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            other => return Err(CodecError::UnknownType(other.to_string())),
        };

        self.expect(')')?;
        Ok(ty)
    }
}

fn last_component(class_name: &str) -> &str {
    class_name.rsplit('.').next().unwrap_or(class_name)
}

fn hex_decode_to_string(hex: &str) -> Result<String, CodecError> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return Err(CodecError::UnknownType(hex.to_string()));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let digits: Vec<char> = hex.chars().collect();
    for pair in digits.chunks(2) {
        let byte_str: String = pair.iter().collect();
        let byte = u8::from_str_radix(&byte_str, 16).map_err(|_| CodecError::UnknownType(hex.to_string()))?;
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|_| CodecError::UnknownType(hex.to_string()))
}

fn scalar_from_class_name(ident: &str) -> Result<ColumnType, CodecError> {
    Ok(match last_component(ident) {
        "AsciiType" => ColumnType::Ascii,
        "UTF8Type" => ColumnType::Varchar,
        "ByteType" => ColumnType::TinyInt,
        "ShortType" => ColumnType::SmallInt,
        "Int32Type" => ColumnType::Int,
        "LongType" => ColumnType::BigInt,
        "IntegerType" => ColumnType::Varint,
        "DecimalType" => ColumnType::Decimal,
        "FloatType" => ColumnType::Float,
        "DoubleType" => ColumnType::Double,
        "BooleanType" => ColumnType::Boolean,
        "TimestampType" | "DateType" => ColumnType::Timestamp,
        "SimpleDateType" => ColumnType::Date,
        "TimeType" => ColumnType::Time,
        "DurationType" => ColumnType::Duration,
        "UUIDType" => ColumnType::Uuid,
        "TimeUUIDType" => ColumnType::TimeUuid,
        "InetAddressType" => ColumnType::Inet,
        "BytesType" => ColumnType::Blob,
        other => return Err(CodecError::UnknownType(other.to_string())),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_scalar() {
        assert_eq!(
            ColumnType::parse_class_name("org.apache.cassandra.db.marshal.UTF8Type").unwrap(),
            ColumnType::Varchar
        );
    }

    #[test]
    fn parses_nested_set_of_map() {
        let s = "org.apache.cassandra.db.marshal.SetType(org.apache.cassandra.db.marshal.MapType(org.apache.cassandra.db.marshal.UTF8Type,org.apache.cassandra.db.marshal.Int32Type))";
        let ty = ColumnType::parse_class_name(s).unwrap();
        assert_eq!(
            ty,
            ColumnType::Set(Box::new(ColumnType::Map(
                Box::new(ColumnType::Varchar),
                Box::new(ColumnType::Int)
            )))
        );
    }

    #[test]
    fn parses_vector_type() {
        let s = "org.apache.cassandra.db.marshal.VectorType(org.apache.cassandra.db.marshal.FloatType, 3)";
        let ty = ColumnType::parse_class_name(s).unwrap();
        assert_eq!(ty, ColumnType::Vector(Box::new(ColumnType::Float), 3));
    }

    #[test]
    fn parses_user_type() {
        // keyspace "ks", name "ut" (75 74), field "a" (61) : Int32Type
        let s = "org.apache.cassandra.db.marshal.UserType(ks,7574,61:org.apache.cassandra.db.marshal.Int32Type)";
        let ty = ColumnType::parse_class_name(s).unwrap();
        assert_eq!(
            ty,
            ColumnType::Udt {
                keyspace: "ks".to_string(),
                name: "ut".to_string(),
                fields: vec![("a".to_string(), ColumnType::Int)],
            }
        );
    }
}
