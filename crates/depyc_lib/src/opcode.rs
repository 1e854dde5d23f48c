//! Canonical operations, per-version byte tables and instruction decoding.

use crate::reader::Reader;
use crate::DepycError;

macro_rules! opcodes {
    (
        plain { $($p:ident = $pn:literal,)* }
        arg { $($a:ident = $an:literal,)* }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($p,)*
            $($a,)*
        }

        impl Opcode {
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$p => $pn,)*
                    $(Opcode::$a => $an,)*
                }
            }

            /// Whether a 16-bit operand word follows the opcode byte.
            pub fn has_arg(self) -> bool {
                matches!(self, $(Opcode::$a)|*)
            }
        }
    };
}

opcodes! {
    plain {
        StopCode = "STOP_CODE",
        PopTop = "POP_TOP",
        RotTwo = "ROT_TWO",
        RotThree = "ROT_THREE",
        DupTop = "DUP_TOP",
        DupTopTwo = "DUP_TOP_TWO",
        RotFour = "ROT_FOUR",
        Nop = "NOP",
        UnaryPositive = "UNARY_POSITIVE",
        UnaryNegative = "UNARY_NEGATIVE",
        UnaryNot = "UNARY_NOT",
        UnaryConvert = "UNARY_CONVERT",
        UnaryInvert = "UNARY_INVERT",
        ListAppend = "LIST_APPEND",
        BinaryPower = "BINARY_POWER",
        BinaryMultiply = "BINARY_MULTIPLY",
        BinaryDivide = "BINARY_DIVIDE",
        BinaryModulo = "BINARY_MODULO",
        BinaryAdd = "BINARY_ADD",
        BinarySubtract = "BINARY_SUBTRACT",
        BinarySubscr = "BINARY_SUBSCR",
        BinaryFloorDivide = "BINARY_FLOOR_DIVIDE",
        BinaryTrueDivide = "BINARY_TRUE_DIVIDE",
        InplaceFloorDivide = "INPLACE_FLOOR_DIVIDE",
        InplaceTrueDivide = "INPLACE_TRUE_DIVIDE",
        Slice0 = "SLICE_0",
        Slice1 = "SLICE_1",
        Slice2 = "SLICE_2",
        Slice3 = "SLICE_3",
        StoreSlice0 = "STORE_SLICE_0",
        StoreSlice1 = "STORE_SLICE_1",
        StoreSlice2 = "STORE_SLICE_2",
        StoreSlice3 = "STORE_SLICE_3",
        DeleteSlice0 = "DELETE_SLICE_0",
        DeleteSlice1 = "DELETE_SLICE_1",
        DeleteSlice2 = "DELETE_SLICE_2",
        DeleteSlice3 = "DELETE_SLICE_3",
        StoreMap = "STORE_MAP",
        InplaceAdd = "INPLACE_ADD",
        InplaceSubtract = "INPLACE_SUBTRACT",
        InplaceMultiply = "INPLACE_MULTIPLY",
        InplaceDivide = "INPLACE_DIVIDE",
        InplaceModulo = "INPLACE_MODULO",
        StoreSubscr = "STORE_SUBSCR",
        DeleteSubscr = "DELETE_SUBSCR",
        BinaryLshift = "BINARY_LSHIFT",
        BinaryRshift = "BINARY_RSHIFT",
        BinaryAnd = "BINARY_AND",
        BinaryXor = "BINARY_XOR",
        BinaryOr = "BINARY_OR",
        InplacePower = "INPLACE_POWER",
        GetIter = "GET_ITER",
        StoreLocals = "STORE_LOCALS",
        PrintExpr = "PRINT_EXPR",
        PrintItem = "PRINT_ITEM",
        PrintNewline = "PRINT_NEWLINE",
        PrintItemTo = "PRINT_ITEM_TO",
        PrintNewlineTo = "PRINT_NEWLINE_TO",
        LoadBuildClass = "LOAD_BUILD_CLASS",
        InplaceLshift = "INPLACE_LSHIFT",
        InplaceRshift = "INPLACE_RSHIFT",
        InplaceAnd = "INPLACE_AND",
        InplaceXor = "INPLACE_XOR",
        InplaceOr = "INPLACE_OR",
        BreakLoop = "BREAK_LOOP",
        WithCleanup = "WITH_CLEANUP",
        LoadLocals = "LOAD_LOCALS",
        ReturnValue = "RETURN_VALUE",
        ImportStar = "IMPORT_STAR",
        ExecStmt = "EXEC_STMT",
        YieldValue = "YIELD_VALUE",
        PopBlock = "POP_BLOCK",
        EndFinally = "END_FINALLY",
        BuildClass = "BUILD_CLASS",
        PopExcept = "POP_EXCEPT",
    }
    arg {
        StoreName = "STORE_NAME",
        DeleteName = "DELETE_NAME",
        UnpackSequence = "UNPACK_SEQUENCE",
        ForIter = "FOR_ITER",
        UnpackEx = "UNPACK_EX",
        ListAppendArg = "LIST_APPEND",
        StoreAttr = "STORE_ATTR",
        DeleteAttr = "DELETE_ATTR",
        StoreGlobal = "STORE_GLOBAL",
        DeleteGlobal = "DELETE_GLOBAL",
        DupTopx = "DUP_TOPX",
        LoadConst = "LOAD_CONST",
        LoadName = "LOAD_NAME",
        BuildTuple = "BUILD_TUPLE",
        BuildList = "BUILD_LIST",
        BuildSet = "BUILD_SET",
        BuildMap = "BUILD_MAP",
        LoadAttr = "LOAD_ATTR",
        CompareOp = "COMPARE_OP",
        ImportName = "IMPORT_NAME",
        ImportFrom = "IMPORT_FROM",
        JumpForward = "JUMP_FORWARD",
        JumpIfFalse = "JUMP_IF_FALSE",
        JumpIfTrue = "JUMP_IF_TRUE",
        JumpIfFalseOrPop = "JUMP_IF_FALSE_OR_POP",
        JumpIfTrueOrPop = "JUMP_IF_TRUE_OR_POP",
        JumpAbsolute = "JUMP_ABSOLUTE",
        PopJumpIfFalse = "POP_JUMP_IF_FALSE",
        PopJumpIfTrue = "POP_JUMP_IF_TRUE",
        LoadGlobal = "LOAD_GLOBAL",
        ContinueLoop = "CONTINUE_LOOP",
        SetupLoop = "SETUP_LOOP",
        SetupExcept = "SETUP_EXCEPT",
        SetupFinally = "SETUP_FINALLY",
        LoadFast = "LOAD_FAST",
        StoreFast = "STORE_FAST",
        DeleteFast = "DELETE_FAST",
        RaiseVarargs = "RAISE_VARARGS",
        CallFunction = "CALL_FUNCTION",
        MakeFunction = "MAKE_FUNCTION",
        BuildSlice = "BUILD_SLICE",
        MakeClosure = "MAKE_CLOSURE",
        LoadClosure = "LOAD_CLOSURE",
        LoadDeref = "LOAD_DEREF",
        StoreDeref = "STORE_DEREF",
        DeleteDeref = "DELETE_DEREF",
        CallFunctionVar = "CALL_FUNCTION_VAR",
        CallFunctionKw = "CALL_FUNCTION_KW",
        CallFunctionVarKw = "CALL_FUNCTION_VAR_KW",
        ExtendedArg = "EXTENDED_ARG",
        SetupWith = "SETUP_WITH",
        SetAdd = "SET_ADD",
        MapAdd = "MAP_ADD",
    }
}

impl Opcode {
    pub fn is_const_arg(self) -> bool {
        self == Opcode::LoadConst
    }

    pub fn is_name_arg(self) -> bool {
        matches!(
            self,
            Opcode::DeleteAttr
                | Opcode::DeleteGlobal
                | Opcode::DeleteName
                | Opcode::ImportFrom
                | Opcode::ImportName
                | Opcode::LoadAttr
                | Opcode::LoadGlobal
                | Opcode::LoadName
                | Opcode::StoreAttr
                | Opcode::StoreGlobal
                | Opcode::StoreName
        )
    }

    pub fn is_varname_arg(self) -> bool {
        matches!(self, Opcode::DeleteFast | Opcode::LoadFast | Opcode::StoreFast)
    }

    pub fn is_cell_arg(self) -> bool {
        matches!(
            self,
            Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref | Opcode::DeleteDeref
        )
    }

    /// Operand is relative to the following instruction.
    pub fn is_jump_offset_arg(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::SetupLoop
                | Opcode::SetupExcept
                | Opcode::SetupFinally
                | Opcode::SetupWith
                | Opcode::ForIter
        )
    }
}

use Opcode::*;

pub static PYTHON_24: &[(u8, Opcode)] = &[
    (0, StopCode), (1, PopTop), (2, RotTwo), (3, RotThree), (4, DupTop), (5, RotFour),
    (9, Nop), (10, UnaryPositive), (11, UnaryNegative), (12, UnaryNot), (13, UnaryConvert),
    (15, UnaryInvert), (18, ListAppend), (19, BinaryPower), (20, BinaryMultiply),
    (21, BinaryDivide), (22, BinaryModulo), (23, BinaryAdd), (24, BinarySubtract),
    (25, BinarySubscr), (26, BinaryFloorDivide), (27, BinaryTrueDivide),
    (28, InplaceFloorDivide), (29, InplaceTrueDivide),
    (30, Slice0), (31, Slice1), (32, Slice2), (33, Slice3),
    (40, StoreSlice0), (41, StoreSlice1), (42, StoreSlice2), (43, StoreSlice3),
    (50, DeleteSlice0), (51, DeleteSlice1), (52, DeleteSlice2), (53, DeleteSlice3),
    (55, InplaceAdd), (56, InplaceSubtract), (57, InplaceMultiply), (58, InplaceDivide),
    (59, InplaceModulo), (60, StoreSubscr), (61, DeleteSubscr), (62, BinaryLshift),
    (63, BinaryRshift), (64, BinaryAnd), (65, BinaryXor), (66, BinaryOr), (67, InplacePower),
    (68, GetIter), (70, PrintExpr), (71, PrintItem), (72, PrintNewline), (73, PrintItemTo),
    (74, PrintNewlineTo), (75, InplaceLshift), (76, InplaceRshift), (77, InplaceAnd),
    (78, InplaceXor), (79, InplaceOr), (80, BreakLoop), (82, LoadLocals),
    (83, ReturnValue), (84, ImportStar), (85, ExecStmt), (86, YieldValue), (87, PopBlock),
    (88, EndFinally), (89, BuildClass), (90, StoreName), (91, DeleteName),
    (92, UnpackSequence), (93, ForIter), (95, StoreAttr), (96, DeleteAttr),
    (97, StoreGlobal), (98, DeleteGlobal), (99, DupTopx), (100, LoadConst), (101, LoadName),
    (102, BuildTuple), (103, BuildList), (104, BuildMap), (105, LoadAttr), (106, CompareOp),
    (107, ImportName), (108, ImportFrom), (110, JumpForward), (111, JumpIfFalse),
    (112, JumpIfTrue), (113, JumpAbsolute), (116, LoadGlobal), (119, ContinueLoop),
    (120, SetupLoop), (121, SetupExcept), (122, SetupFinally), (124, LoadFast),
    (125, StoreFast), (126, DeleteFast), (130, RaiseVarargs), (131, CallFunction),
    (132, MakeFunction), (133, BuildSlice), (134, MakeClosure), (135, LoadClosure),
    (136, LoadDeref), (137, StoreDeref), (140, CallFunctionVar), (141, CallFunctionKw),
    (142, CallFunctionVarKw), (143, ExtendedArg),
];

pub static PYTHON_25: &[(u8, Opcode)] = &[
    (0, StopCode), (1, PopTop), (2, RotTwo), (3, RotThree), (4, DupTop), (5, RotFour),
    (9, Nop), (10, UnaryPositive), (11, UnaryNegative), (12, UnaryNot), (13, UnaryConvert),
    (15, UnaryInvert), (18, ListAppend), (19, BinaryPower), (20, BinaryMultiply),
    (21, BinaryDivide), (22, BinaryModulo), (23, BinaryAdd), (24, BinarySubtract),
    (25, BinarySubscr), (26, BinaryFloorDivide), (27, BinaryTrueDivide),
    (28, InplaceFloorDivide), (29, InplaceTrueDivide),
    (30, Slice0), (31, Slice1), (32, Slice2), (33, Slice3),
    (40, StoreSlice0), (41, StoreSlice1), (42, StoreSlice2), (43, StoreSlice3),
    (50, DeleteSlice0), (51, DeleteSlice1), (52, DeleteSlice2), (53, DeleteSlice3),
    (55, InplaceAdd), (56, InplaceSubtract), (57, InplaceMultiply), (58, InplaceDivide),
    (59, InplaceModulo), (60, StoreSubscr), (61, DeleteSubscr), (62, BinaryLshift),
    (63, BinaryRshift), (64, BinaryAnd), (65, BinaryXor), (66, BinaryOr), (67, InplacePower),
    (68, GetIter), (70, PrintExpr), (71, PrintItem), (72, PrintNewline), (73, PrintItemTo),
    (74, PrintNewlineTo), (75, InplaceLshift), (76, InplaceRshift), (77, InplaceAnd),
    (78, InplaceXor), (79, InplaceOr), (80, BreakLoop), (81, WithCleanup), (82, LoadLocals),
    (83, ReturnValue), (84, ImportStar), (85, ExecStmt), (86, YieldValue), (87, PopBlock),
    (88, EndFinally), (89, BuildClass), (90, StoreName), (91, DeleteName),
    (92, UnpackSequence), (93, ForIter), (95, StoreAttr), (96, DeleteAttr),
    (97, StoreGlobal), (98, DeleteGlobal), (99, DupTopx), (100, LoadConst), (101, LoadName),
    (102, BuildTuple), (103, BuildList), (104, BuildMap), (105, LoadAttr), (106, CompareOp),
    (107, ImportName), (108, ImportFrom), (110, JumpForward), (111, JumpIfFalse),
    (112, JumpIfTrue), (113, JumpAbsolute), (116, LoadGlobal), (119, ContinueLoop),
    (120, SetupLoop), (121, SetupExcept), (122, SetupFinally), (124, LoadFast),
    (125, StoreFast), (126, DeleteFast), (130, RaiseVarargs), (131, CallFunction),
    (132, MakeFunction), (133, BuildSlice), (134, MakeClosure), (135, LoadClosure),
    (136, LoadDeref), (137, StoreDeref), (140, CallFunctionVar), (141, CallFunctionKw),
    (142, CallFunctionVarKw), (143, ExtendedArg),
];

pub static PYTHON_26: &[(u8, Opcode)] = &[
    (0, StopCode), (1, PopTop), (2, RotTwo), (3, RotThree), (4, DupTop), (5, RotFour),
    (9, Nop), (10, UnaryPositive), (11, UnaryNegative), (12, UnaryNot), (13, UnaryConvert),
    (15, UnaryInvert), (18, ListAppend), (19, BinaryPower), (20, BinaryMultiply),
    (21, BinaryDivide), (22, BinaryModulo), (23, BinaryAdd), (24, BinarySubtract),
    (25, BinarySubscr), (26, BinaryFloorDivide), (27, BinaryTrueDivide),
    (28, InplaceFloorDivide), (29, InplaceTrueDivide),
    (30, Slice0), (31, Slice1), (32, Slice2), (33, Slice3),
    (40, StoreSlice0), (41, StoreSlice1), (42, StoreSlice2), (43, StoreSlice3),
    (50, DeleteSlice0), (51, DeleteSlice1), (52, DeleteSlice2), (53, DeleteSlice3),
    (54, StoreMap), (55, InplaceAdd), (56, InplaceSubtract), (57, InplaceMultiply),
    (58, InplaceDivide), (59, InplaceModulo), (60, StoreSubscr), (61, DeleteSubscr),
    (62, BinaryLshift), (63, BinaryRshift), (64, BinaryAnd), (65, BinaryXor), (66, BinaryOr),
    (67, InplacePower), (68, GetIter), (70, PrintExpr), (71, PrintItem), (72, PrintNewline),
    (73, PrintItemTo), (74, PrintNewlineTo), (75, InplaceLshift), (76, InplaceRshift),
    (77, InplaceAnd), (78, InplaceXor), (79, InplaceOr), (80, BreakLoop), (81, WithCleanup),
    (82, LoadLocals), (83, ReturnValue), (84, ImportStar), (85, ExecStmt), (86, YieldValue),
    (87, PopBlock), (88, EndFinally), (89, BuildClass), (90, StoreName), (91, DeleteName),
    (92, UnpackSequence), (93, ForIter), (95, StoreAttr), (96, DeleteAttr),
    (97, StoreGlobal), (98, DeleteGlobal), (99, DupTopx), (100, LoadConst), (101, LoadName),
    (102, BuildTuple), (103, BuildList), (104, BuildMap), (105, LoadAttr), (106, CompareOp),
    (107, ImportName), (108, ImportFrom), (110, JumpForward), (111, JumpIfFalse),
    (112, JumpIfTrue), (113, JumpAbsolute), (116, LoadGlobal), (119, ContinueLoop),
    (120, SetupLoop), (121, SetupExcept), (122, SetupFinally), (124, LoadFast),
    (125, StoreFast), (126, DeleteFast), (130, RaiseVarargs), (131, CallFunction),
    (132, MakeFunction), (133, BuildSlice), (134, MakeClosure), (135, LoadClosure),
    (136, LoadDeref), (137, StoreDeref), (140, CallFunctionVar), (141, CallFunctionKw),
    (142, CallFunctionVarKw), (143, ExtendedArg),
];

pub static PYTHON_27: &[(u8, Opcode)] = &[
    (0, StopCode), (1, PopTop), (2, RotTwo), (3, RotThree), (4, DupTop), (5, RotFour),
    (9, Nop), (10, UnaryPositive), (11, UnaryNegative), (12, UnaryNot), (13, UnaryConvert),
    (15, UnaryInvert), (19, BinaryPower), (20, BinaryMultiply),
    (21, BinaryDivide), (22, BinaryModulo), (23, BinaryAdd), (24, BinarySubtract),
    (25, BinarySubscr), (26, BinaryFloorDivide), (27, BinaryTrueDivide),
    (28, InplaceFloorDivide), (29, InplaceTrueDivide),
    (30, Slice0), (31, Slice1), (32, Slice2), (33, Slice3),
    (40, StoreSlice0), (41, StoreSlice1), (42, StoreSlice2), (43, StoreSlice3),
    (50, DeleteSlice0), (51, DeleteSlice1), (52, DeleteSlice2), (53, DeleteSlice3),
    (54, StoreMap), (55, InplaceAdd), (56, InplaceSubtract), (57, InplaceMultiply),
    (58, InplaceDivide), (59, InplaceModulo), (60, StoreSubscr), (61, DeleteSubscr),
    (62, BinaryLshift), (63, BinaryRshift), (64, BinaryAnd), (65, BinaryXor), (66, BinaryOr),
    (67, InplacePower), (68, GetIter), (70, PrintExpr), (71, PrintItem), (72, PrintNewline),
    (73, PrintItemTo), (74, PrintNewlineTo), (75, InplaceLshift), (76, InplaceRshift),
    (77, InplaceAnd), (78, InplaceXor), (79, InplaceOr), (80, BreakLoop), (81, WithCleanup),
    (82, LoadLocals), (83, ReturnValue), (84, ImportStar), (85, ExecStmt), (86, YieldValue),
    (87, PopBlock), (88, EndFinally), (89, BuildClass), (90, StoreName), (91, DeleteName),
    (92, UnpackSequence), (93, ForIter), (94, ListAppendArg), (95, StoreAttr),
    (96, DeleteAttr), (97, StoreGlobal), (98, DeleteGlobal), (99, DupTopx), (100, LoadConst),
    (101, LoadName), (102, BuildTuple), (103, BuildList), (104, BuildSet), (105, BuildMap),
    (106, LoadAttr), (107, CompareOp), (108, ImportName), (109, ImportFrom),
    (110, JumpForward), (111, JumpIfFalseOrPop), (112, JumpIfTrueOrPop), (113, JumpAbsolute),
    (114, PopJumpIfFalse), (115, PopJumpIfTrue), (116, LoadGlobal), (119, ContinueLoop),
    (120, SetupLoop), (121, SetupExcept), (122, SetupFinally), (124, LoadFast),
    (125, StoreFast), (126, DeleteFast), (130, RaiseVarargs), (131, CallFunction),
    (132, MakeFunction), (133, BuildSlice), (134, MakeClosure), (135, LoadClosure),
    (136, LoadDeref), (137, StoreDeref), (140, CallFunctionVar), (141, CallFunctionKw),
    (142, CallFunctionVarKw), (143, SetupWith), (145, ExtendedArg), (146, SetAdd),
    (147, MapAdd),
];

pub static PYTHON_31: &[(u8, Opcode)] = &[
    (0, StopCode), (1, PopTop), (2, RotTwo), (3, RotThree), (4, DupTop), (5, RotFour),
    (9, Nop), (10, UnaryPositive), (11, UnaryNegative), (12, UnaryNot), (15, UnaryInvert),
    (19, BinaryPower), (20, BinaryMultiply), (22, BinaryModulo), (23, BinaryAdd),
    (24, BinarySubtract), (25, BinarySubscr), (26, BinaryFloorDivide),
    (27, BinaryTrueDivide), (28, InplaceFloorDivide), (29, InplaceTrueDivide),
    (54, StoreMap), (55, InplaceAdd), (56, InplaceSubtract), (57, InplaceMultiply),
    (59, InplaceModulo), (60, StoreSubscr), (61, DeleteSubscr), (62, BinaryLshift),
    (63, BinaryRshift), (64, BinaryAnd), (65, BinaryXor), (66, BinaryOr), (67, InplacePower),
    (68, GetIter), (69, StoreLocals), (70, PrintExpr), (71, LoadBuildClass),
    (75, InplaceLshift), (76, InplaceRshift), (77, InplaceAnd), (78, InplaceXor),
    (79, InplaceOr), (80, BreakLoop), (81, WithCleanup), (83, ReturnValue), (84, ImportStar),
    (86, YieldValue), (87, PopBlock), (88, EndFinally), (89, PopExcept), (90, StoreName),
    (91, DeleteName), (92, UnpackSequence), (93, ForIter), (94, UnpackEx), (95, StoreAttr),
    (96, DeleteAttr), (97, StoreGlobal), (98, DeleteGlobal), (99, DupTopx), (100, LoadConst),
    (101, LoadName), (102, BuildTuple), (103, BuildList), (104, BuildSet), (105, BuildMap),
    (106, LoadAttr), (107, CompareOp), (108, ImportName), (109, ImportFrom),
    (110, JumpForward), (111, JumpIfFalseOrPop), (112, JumpIfTrueOrPop), (113, JumpAbsolute),
    (114, PopJumpIfFalse), (115, PopJumpIfTrue), (116, LoadGlobal), (119, ContinueLoop),
    (120, SetupLoop), (121, SetupExcept), (122, SetupFinally), (124, LoadFast),
    (125, StoreFast), (126, DeleteFast), (130, RaiseVarargs), (131, CallFunction),
    (132, MakeFunction), (133, BuildSlice), (134, MakeClosure), (135, LoadClosure),
    (136, LoadDeref), (137, StoreDeref), (140, CallFunctionVar), (141, CallFunctionKw),
    (142, CallFunctionVarKw), (143, ExtendedArg), (145, ListAppendArg), (146, SetAdd),
    (147, MapAdd),
];

pub static PYTHON_32: &[(u8, Opcode)] = &[
    (0, StopCode), (1, PopTop), (2, RotTwo), (3, RotThree), (4, DupTop), (5, DupTopTwo),
    (9, Nop), (10, UnaryPositive), (11, UnaryNegative), (12, UnaryNot), (15, UnaryInvert),
    (19, BinaryPower), (20, BinaryMultiply), (22, BinaryModulo), (23, BinaryAdd),
    (24, BinarySubtract), (25, BinarySubscr), (26, BinaryFloorDivide),
    (27, BinaryTrueDivide), (28, InplaceFloorDivide), (29, InplaceTrueDivide),
    (54, StoreMap), (55, InplaceAdd), (56, InplaceSubtract), (57, InplaceMultiply),
    (59, InplaceModulo), (60, StoreSubscr), (61, DeleteSubscr), (62, BinaryLshift),
    (63, BinaryRshift), (64, BinaryAnd), (65, BinaryXor), (66, BinaryOr), (67, InplacePower),
    (68, GetIter), (69, StoreLocals), (70, PrintExpr), (71, LoadBuildClass),
    (75, InplaceLshift), (76, InplaceRshift), (77, InplaceAnd), (78, InplaceXor),
    (79, InplaceOr), (80, BreakLoop), (81, WithCleanup), (83, ReturnValue), (84, ImportStar),
    (86, YieldValue), (87, PopBlock), (88, EndFinally), (89, PopExcept), (90, StoreName),
    (91, DeleteName), (92, UnpackSequence), (93, ForIter), (94, UnpackEx), (95, StoreAttr),
    (96, DeleteAttr), (97, StoreGlobal), (98, DeleteGlobal), (100, LoadConst),
    (101, LoadName), (102, BuildTuple), (103, BuildList), (104, BuildSet), (105, BuildMap),
    (106, LoadAttr), (107, CompareOp), (108, ImportName), (109, ImportFrom),
    (110, JumpForward), (111, JumpIfFalseOrPop), (112, JumpIfTrueOrPop), (113, JumpAbsolute),
    (114, PopJumpIfFalse), (115, PopJumpIfTrue), (116, LoadGlobal), (119, ContinueLoop),
    (120, SetupLoop), (121, SetupExcept), (122, SetupFinally), (124, LoadFast),
    (125, StoreFast), (126, DeleteFast), (130, RaiseVarargs), (131, CallFunction),
    (132, MakeFunction), (133, BuildSlice), (134, MakeClosure), (135, LoadClosure),
    (136, LoadDeref), (137, StoreDeref), (138, DeleteDeref), (140, CallFunctionVar),
    (141, CallFunctionKw), (142, CallFunctionVarKw), (143, SetupWith), (144, ExtendedArg),
    (145, ListAppendArg), (146, SetAdd), (147, MapAdd),
];

fn lookup(table: Option<&[(u8, Opcode)]>, byte: u8) -> Option<Opcode> {
    let table = table?;
    table
        .binary_search_by_key(&byte, |&(b, _)| b)
        .ok()
        .map(|i| table[i].1)
}

/// One decoded instruction. `opcode` is `None` for bytes the version does not define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub offset: usize,
    pub raw: u8,
    pub opcode: Option<Opcode>,
    pub operand: u32,
    /// Offset of the following instruction; jump offsets are relative to it.
    pub next: usize,
}

impl Instr {
    pub fn name(&self) -> &'static str {
        self.opcode.map_or("<INVALID>", Opcode::name)
    }

    pub fn jump_target(&self) -> usize {
        self.next + self.operand as usize
    }
}

/// Streams instructions out of a routine's bytecode.
pub struct Instructions<'a> {
    reader: Reader<'a>,
    table: Option<&'static [(u8, Opcode)]>,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8], table: Option<&'static [(u8, Opcode)]>) -> Self {
        Self {
            reader: Reader::new(code),
            table,
        }
    }

    fn decode(&mut self) -> Result<Instr, DepycError> {
        let offset = self.reader.pos();
        let truncated = |_| DepycError::TruncatedInstruction { offset };

        let mut raw = self.reader.get_u8().map_err(truncated)?;
        let mut opcode = lookup(self.table, raw);
        let mut operand = 0u32;
        let mut extended = false;

        if opcode == Some(Opcode::ExtendedArg) {
            operand = (self.reader.get_u16().map_err(truncated)? as u32) << 16;
            raw = self.reader.get_u8().map_err(truncated)?;
            opcode = lookup(self.table, raw);
            extended = true;
        }

        if opcode.is_some_and(Opcode::has_arg) {
            let low = self.reader.get_u16().map_err(truncated)? as u32;
            operand = if extended { operand | low } else { low };
        }

        Ok(Instr {
            offset,
            raw,
            opcode,
            operand,
            next: self.reader.pos(),
        })
    }
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instr, DepycError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.at_eof() {
            return None;
        }
        let item = self.decode();
        if item.is_err() {
            // Stop after a truncated tail.
            self.reader = Reader::new(&[]);
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(code: &[u8], table: &'static [(u8, Opcode)]) -> Vec<Instr> {
        Instructions::new(code, Some(table))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn plain_and_arg_widths() {
        let ins = decode_all(&[100, 1, 0, 23, 83], PYTHON_27);
        assert_eq!(ins.len(), 3);
        assert_eq!(ins[0].opcode, Some(LoadConst));
        assert_eq!(ins[0].operand, 1);
        assert_eq!(ins[0].next, 3);
        assert_eq!(ins[1].opcode, Some(BinaryAdd));
        assert_eq!(ins[2].offset, 4);
    }

    #[test]
    fn extended_arg_merges_high_word() {
        let ins = decode_all(&[145, 0x01, 0x00, 100, 0x02, 0x00], PYTHON_27);
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].opcode, Some(LoadConst));
        assert_eq!(ins[0].operand, 0x0001_0002);
        assert_eq!(ins[0].next, 6);
    }

    #[test]
    fn same_byte_differs_across_versions() {
        assert_eq!(lookup(Some(PYTHON_26), 111), Some(JumpIfFalse));
        assert_eq!(lookup(Some(PYTHON_27), 111), Some(JumpIfFalseOrPop));
        assert_eq!(lookup(Some(PYTHON_31), 5), Some(RotFour));
        assert_eq!(lookup(Some(PYTHON_32), 5), Some(DupTopTwo));
        assert_eq!(lookup(Some(PYTHON_24), 81), None);
        assert_eq!(lookup(Some(PYTHON_25), 81), Some(WithCleanup));
    }

    #[test]
    fn unknown_byte_is_invalid() {
        let ins = decode_all(&[200], PYTHON_27);
        assert_eq!(ins[0].opcode, None);
        assert_eq!(ins[0].name(), "<INVALID>");
        let none = Instructions::new(&[1], None).next().unwrap().unwrap();
        assert_eq!(none.opcode, None);
    }

    #[test]
    fn truncated_operand_is_an_error() {
        let mut it = Instructions::new(&[83, 100, 1], Some(PYTHON_27));
        assert!(it.next().unwrap().is_ok());
        assert!(matches!(
            it.next(),
            Some(Err(DepycError::TruncatedInstruction { offset: 1 }))
        ));
        assert!(it.next().is_none());
    }

    #[test]
    fn jump_target_is_relative_to_next() {
        let ins = decode_all(&[110, 6, 0], PYTHON_27);
        assert_eq!(ins[0].jump_target(), 9);
        assert!(JumpForward.is_jump_offset_arg());
        assert!(!JumpAbsolute.is_jump_offset_arg());
    }
}
