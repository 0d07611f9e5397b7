//! Database schema.
//!
//! Integer primary keys throughout; foreign keys by id. `SourceLocation`
//! carries a uniqueness constraint so repeated interning of the same
//! `(function, line, column)` triple is an ignored no-op.

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Image(
    Id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    Name VARCHAR);
CREATE TABLE IF NOT EXISTS File(
    Id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    Path VARCHAR,
    Image INTEGER);
CREATE TABLE IF NOT EXISTS Function(
    Id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    Name VARCHAR,
    Prototype VARCHAR,
    File INTEGER,
    Line INTEGER);
CREATE TABLE IF NOT EXISTS SourceLocation(
    Id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    Function INTEGER,
    Line INTEGER,
    \"Column\" INTEGER,
    UNIQUE(Function, Line, \"Column\") ON CONFLICT IGNORE);
CREATE TABLE IF NOT EXISTS Tag(
    Id INTEGER PRIMARY KEY NOT NULL,
    Name VARCHAR,
    Type INTEGER);
CREATE TABLE IF NOT EXISTS TagInstruction(
    Id INTEGER PRIMARY KEY NOT NULL,
    Tag INTEGER,
    Location INTEGER,
    Type INTEGER);
CREATE TABLE IF NOT EXISTS TagInstance(
    Id INTEGER PRIMARY KEY NOT NULL,
    Tag INTEGER,
    Thread INTEGER,
    Start INTEGER,
    \"End\" INTEGER,
    Counter INTEGER);
CREATE TABLE IF NOT EXISTS Thread(
    Id INTEGER PRIMARY KEY NOT NULL,
    StartTime INTEGER,
    StartTSC INTEGER,
    EndTime INTEGER,
    EndTSC INTEGER);
CREATE TABLE IF NOT EXISTS Call(
    Id INTEGER PRIMARY KEY NOT NULL,
    Thread INTEGER,
    Function INTEGER,
    Instruction INTEGER,
    Start INTEGER,
    \"End\" INTEGER);
CREATE TABLE IF NOT EXISTS Segment(
    Id INTEGER PRIMARY KEY NOT NULL,
    Call INTEGER,
    Type INTEGER);
CREATE TABLE IF NOT EXISTS Instruction(
    Id INTEGER PRIMARY KEY NOT NULL,
    Segment INTEGER,
    Type INTEGER,
    Line INTEGER,
    \"Column\" INTEGER);
CREATE TABLE IF NOT EXISTS Reference(
    Id INTEGER PRIMARY KEY NOT NULL,
    Name VARCHAR,
    Size INTEGER,
    Type INTEGER,
    Allocator INTEGER,
    Deallocator INTEGER);
CREATE TABLE IF NOT EXISTS Access(
    Id INTEGER PRIMARY KEY NOT NULL,
    Instruction INTEGER,
    Reference INTEGER,
    Position INTEGER,
    Address INTEGER,
    Size INTEGER,
    Type INTEGER);
CREATE TABLE IF NOT EXISTS Conflict(
    Id INTEGER PRIMARY KEY NOT NULL,
    TagInstance1 INTEGER,
    TagInstance2 INTEGER,
    Access1 INTEGER,
    Access2 INTEGER);
CREATE TABLE IF NOT EXISTS InstructionTagInstance(
    Instruction INTEGER,
    TagInstance INTEGER);
CREATE TABLE IF NOT EXISTS CallTagInstance(
    Call INTEGER,
    TagInstance INTEGER);
CREATE TABLE IF NOT EXISTS TagHit(
    Tsc INTEGER,
    TagInstruction INTEGER,
    Thread INTEGER);
";
